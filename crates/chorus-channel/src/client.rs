//! Consumer-side channel client.
//!
//! Wraps a transport in a correlation table and a watchdog: every request
//! gets a fresh id and resolves when the matching response arrives, or
//! fails locally when the watchdog fires first. `Unauthorized` and
//! `Token expired` responses clear the persisted token on the spot — the
//! old token is never silently retried.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chorus_core::{BrokerEvent, ChannelConfig, Error, Result, Target};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::frame::{Frame, OpResult, RequestKind};
use crate::transport::Transport;

/// Connection lifecycle of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

/// File-backed storage for the pairing token.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn load(&self) -> Option<String> {
        let data = std::fs::read_to_string(&self.path).ok()?;
        let value: Value = serde_json::from_str(&data).ok()?;
        value.get("token")?.as_str().map(str::to_string)
    }

    pub fn save(&self, token: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&json!({ "token": token }))?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    pub fn clear(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

type PendingMap = DashMap<String, oneshot::Sender<Result<Option<Value>>>>;

pub struct ChannelClient {
    config: ChannelConfig,
    state: Arc<RwLock<ChannelState>>,
    token: RwLock<Option<String>>,
    store: TokenStore,
    pending: Arc<PendingMap>,
    outbound: mpsc::Sender<Frame>,
    events: broadcast::Sender<BrokerEvent>,
}

impl ChannelClient {
    /// Take ownership of a transport and bring the connection up.
    ///
    /// The transport gives no acknowledgment primitive, so surviving the
    /// grace window without teardown is what counts as a handshake.
    pub async fn connect<T: Transport + 'static>(
        mut transport: T,
        config: ChannelConfig,
        store: TokenStore,
    ) -> Result<Self> {
        let token = store.load();
        let state = Arc::new(RwLock::new(ChannelState::Connecting));
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let (outbound, mut outbound_rx) = mpsc::channel::<Frame>(64);
        let (events, _) = broadcast::channel(64);

        let io_state = state.clone();
        let io_pending = pending.clone();
        let io_events = events.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    inbound = transport.recv() => {
                        let Some(frame) = inbound else { break };
                        match frame {
                            Frame::Res { id, ok, data, error } => {
                                let Some((_, reply)) = io_pending.remove(&id) else {
                                    debug!("Dropping response with unknown id {}", id);
                                    continue;
                                };
                                let result = if ok {
                                    Ok(data)
                                } else {
                                    Err(Error::from_wire(
                                        error.as_deref().unwrap_or("Unknown error"),
                                    ))
                                };
                                let _ = reply.send(result);
                            }
                            Frame::Evt { event } => {
                                let _ = io_events.send(event);
                            }
                            // The host never originates requests.
                            Frame::Req { .. } => {}
                        }
                    }
                    frame = outbound_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if transport.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
            }
            *io_state.write() = ChannelState::Disconnected;
        });

        tokio::time::sleep(config.connect_grace()).await;
        if *state.read() == ChannelState::Disconnected {
            return Err(Error::Channel("connection closed during handshake".into()));
        }
        *state.write() = ChannelState::Connected;

        Ok(Self {
            config,
            state,
            token: RwLock::new(token),
            store,
            pending,
            outbound,
            events,
        })
    }

    pub fn state(&self) -> ChannelState {
        *self.state.read()
    }

    pub fn is_paired(&self) -> bool {
        self.token.read().is_some()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Forget the pairing, in memory and on disk.
    pub fn clear_pairing(&self) {
        *self.token.write() = None;
        self.store.clear();
    }

    /// Ask the broker for a fresh pairing code.
    pub async fn request_pairing_code(&self) -> Result<String> {
        let data = required(self.request(RequestKind::GetPairCode, None).await?)?;
        data["code"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Channel("no code in pairing response".into()))
    }

    /// Confirm the code the operator entered; persists the minted token.
    pub async fn confirm_pairing(&self, code: &str) -> Result<()> {
        let data = required(
            self.request(RequestKind::PairConfirm, Some(json!({ "code": code })))
                .await?,
        )?;
        let token = data["token"]
            .as_str()
            .ok_or_else(|| Error::Channel("no token in pairing response".into()))?;
        *self.token.write() = Some(token.to_string());
        if let Err(err) = self.store.save(token) {
            warn!("Failed to persist pairing token: {}", err);
        }
        Ok(())
    }

    pub async fn send_message(&self, target: Target, message: &str) -> Result<()> {
        self.request(
            RequestKind::SendMessage,
            Some(json!({ "target": target, "message": message })),
        )
        .await?;
        Ok(())
    }

    pub async fn get_response(&self, target: Target) -> Result<Option<String>> {
        let data = required(
            self.request(RequestKind::GetResponse, Some(json!({ "target": target })))
                .await?,
        )?;
        Ok(data["content"].as_str().map(str::to_string))
    }

    pub async fn get_status(&self) -> Result<HashMap<Target, bool>> {
        let data = required(self.request(RequestKind::GetStatus, None).await?)?;
        let mut statuses = HashMap::new();
        if let Some(map) = data["statuses"].as_object() {
            for (name, connected) in map {
                if let Some(target) = Target::from_name(name) {
                    statuses.insert(target, connected.as_bool().unwrap_or(false));
                }
            }
        }
        Ok(statuses)
    }

    pub async fn new_conversation(
        &self,
        targets: &[Target],
    ) -> Result<HashMap<Target, OpResult>> {
        let data = required(
            self.request(
                RequestKind::NewConversation,
                Some(json!({ "targets": targets })),
            )
            .await?,
        )?;
        let mut results = HashMap::new();
        if let Some(map) = data["results"].as_object() {
            for (name, entry) in map {
                if let Some(target) = Target::from_name(name) {
                    if let Ok(result) = serde_json::from_value(entry.clone()) {
                        results.insert(target, result);
                    }
                }
            }
        }
        Ok(results)
    }

    async fn request(
        &self,
        kind: RequestKind,
        payload: Option<Value>,
    ) -> Result<Option<Value>> {
        if self.state() != ChannelState::Connected {
            return Err(Error::Channel("not connected".into()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let frame = Frame::Req {
            id: id.clone(),
            kind,
            payload,
            token: self.token.read().clone(),
        };

        let (reply, rx) = oneshot::channel();
        self.pending.insert(id.clone(), reply);

        if self.outbound.send(frame).await.is_err() {
            self.pending.remove(&id);
            return Err(Error::Channel("connection closed".into()));
        }

        let result = match tokio::time::timeout(self.config.request_timeout(), rx).await {
            // Watchdog: fail locally and drop the pending entry. The
            // server-side operation may still complete later.
            Err(_) => {
                self.pending.remove(&id);
                Err(Error::Timeout)
            }
            Ok(Err(_)) => Err(Error::Channel("connection closed".into())),
            Ok(Ok(result)) => result,
        };

        if let Err(err) = &result {
            if err.invalidates_token() {
                warn!("Pairing rejected ({}), clearing stored token", err);
                self.clear_pairing();
            }
        }
        result
    }
}

fn required(data: Option<Value>) -> Result<Value> {
    data.ok_or_else(|| Error::Channel("empty response".into()))
}
