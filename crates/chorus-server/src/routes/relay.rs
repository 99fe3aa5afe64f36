//! Browser-agent relay endpoint.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::relay::{RelayDown, RelayUp};
use crate::state::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent(socket, state))
}

async fn handle_agent(socket: WebSocket, state: Arc<AppState>) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<RelayDown>(32);
    let link = state.relay.register(outbound_tx);
    info!("Browser agent connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            down = outbound_rx.recv() => {
                let Some(down) = down else { break };
                let json = match serde_json::to_string(&down) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to serialize relay frame: {}", e);
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            up = ws_rx.next() => {
                match up {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<RelayUp>(text.as_str()) {
                            Ok(RelayUp::Hello { agent }) => info!("Agent identified: {}", agent),
                            Ok(RelayUp::TabLoaded { url }) => state.broker.note_tab_loaded(&url),
                            Ok(reply) => link.complete(reply),
                            Err(e) => warn!("Dropping malformed relay frame: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("Agent socket error: {}", e);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.relay.unregister(&link);
    info!("Browser agent disconnected");
}
