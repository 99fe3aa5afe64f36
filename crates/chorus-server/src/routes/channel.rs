//! Consumer session channel over WebSocket.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chorus_channel::{Frame, SessionHost, Transport};
use chorus_core::{Error, Result};
use tracing::{info, warn};

use crate::state::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        info!("Consumer connected");
        let host = SessionHost::new(state.broker.clone(), state.gate.clone());
        host.serve(WsServerTransport { socket }).await;
        info!("Consumer disconnected");
    })
}

/// Adapts an accepted WebSocket to the channel's transport seam.
struct WsServerTransport {
    socket: WebSocket,
}

#[async_trait]
impl Transport for WsServerTransport {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let json = serde_json::to_string(&frame)?;
        self.socket
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| Error::Channel(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Frame> {
        while let Some(message) = self.socket.recv().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str(text.as_str()) {
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
