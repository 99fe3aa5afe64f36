//! Per-target listener tasks.
//!
//! A listener owns the driver bound to its tab, answers broker requests
//! over an mpsc channel, and runs the capture triggers: a watch spawned
//! after every injected message, plus the passive re-capture poll. A
//! closed request channel is what the broker sees as "listener endpoint
//! does not exist" — the retryable class.

use std::sync::Arc;
use std::time::Duration;

use chorus_capture::CaptureEngine;
use chorus_core::{Error, OpReply, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::driver::TabDriver;

/// Requests a listener answers, mirroring the listener-facing contract.
#[derive(Debug, Clone)]
pub enum ListenerRequest {
    Ping,
    Inject { text: String },
    ReadLatest,
    NewConversation,
}

struct ListenerCall {
    request: ListenerRequest,
    reply: oneshot::Sender<Result<OpReply>>,
}

/// Cheap handle to a running listener task.
#[derive(Clone)]
pub struct ListenerHandle {
    tx: mpsc::Sender<ListenerCall>,
}

impl ListenerHandle {
    /// Round-trip one request. Fails with [`Error::ListenerGone`] when the
    /// task is no longer receiving.
    pub async fn call(&self, request: ListenerRequest) -> Result<OpReply> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ListenerCall { request, reply })
            .await
            .map_err(|_| Error::ListenerGone)?;
        rx.await.map_err(|_| Error::ListenerGone)?
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn a listener bound to an attached driver.
pub fn spawn_listener(
    driver: Arc<dyn TabDriver>,
    engine: Arc<CaptureEngine>,
    poll_interval: Duration,
) -> ListenerHandle {
    let (tx, mut rx) = mpsc::channel::<ListenerCall>(16);

    tokio::spawn(async move {
        let mut poll = tokio::time::interval(poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if !driver.context_valid() {
                break;
            }
            tokio::select! {
                call = rx.recv() => {
                    let Some(ListenerCall { request, reply }) = call else {
                        break;
                    };
                    let result = handle_request(&driver, &engine, request).await;
                    let _ = reply.send(result);
                }
                _ = poll.tick() => {
                    if engine.should_recapture(&*driver).await {
                        let engine = engine.clone();
                        let driver = driver.clone();
                        tokio::spawn(async move {
                            engine.watch(&*driver).await;
                        });
                    }
                }
            }
        }
        debug!("{}: listener exited", engine.record().target());
    });

    ListenerHandle { tx }
}

async fn handle_request(
    driver: &Arc<dyn TabDriver>,
    engine: &Arc<CaptureEngine>,
    request: ListenerRequest,
) -> Result<OpReply> {
    match request {
        ListenerRequest::Ping => Ok(OpReply::Alive),
        ListenerRequest::Inject { text } => {
            driver.inject_message(&text).await?;
            // Post-send trigger; single-flight drops it if a session is
            // already running.
            let engine = engine.clone();
            let driver = driver.clone();
            tokio::spawn(async move {
                engine.watch(&*driver).await;
            });
            Ok(OpReply::Sent)
        }
        ListenerRequest::ReadLatest => Ok(OpReply::Content(engine.read_latest(&**driver).await)),
        ListenerRequest::NewConversation => {
            driver.new_conversation().await?;
            Ok(OpReply::Started)
        }
    }
}
