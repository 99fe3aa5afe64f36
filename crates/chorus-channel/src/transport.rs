//! Frame transports.
//!
//! The channel logic is transport-agnostic: the broker side serves
//! whatever framed pipe it is handed, the client side connects over
//! WebSocket in production and an in-memory duplex in tests.

use async_trait::async_trait;
use chorus_core::{Error, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::warn;

use crate::frame::Frame;

/// A bidirectional, ordered frame pipe.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// Next inbound frame, or `None` once the peer has closed.
    async fn recv(&mut self) -> Option<Frame>;
}

/// In-memory transport pair for tests and same-process consumers.
pub struct DuplexTransport {
    tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<Frame>,
}

/// Create a connected transport pair.
pub fn duplex(capacity: usize) -> (DuplexTransport, DuplexTransport) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        DuplexTransport { tx: a_tx, rx: b_rx },
        DuplexTransport { tx: b_tx, rx: a_rx },
    )
}

#[async_trait]
impl Transport for DuplexTransport {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| Error::Channel("peer closed".into()))
    }

    async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

/// WebSocket client transport (consumer side).
pub struct WsTransport {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsTransport {
    pub async fn connect(url: &str) -> Result<Self> {
        let (inner, _) = connect_async(url)
            .await
            .map_err(|e| Error::Channel(e.to_string()))?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let json = serde_json::to_string(&frame)?;
        self.inner
            .send(Message::Text(json))
            .await
            .map_err(|e| Error::Channel(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Frame> {
        while let Some(message) = self.inner.next().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str(&text) {
                    Ok(frame) => return Some(frame),
                    Err(e) => warn!("Dropping malformed frame: {}", e),
                },
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
        None
    }
}
