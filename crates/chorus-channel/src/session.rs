//! Broker-side session host — one per consumer connection.

use std::sync::Arc;

use chorus_broker::DispatchBroker;
use chorus_core::{Error, OpReply, Operation, Result};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::frame::{
    resolve_target, Frame, NewConversationPayload, OpResult, PairConfirmPayload, RequestKind,
    SendMessagePayload, TargetPayload,
};
use crate::pairing::PairingGate;
use crate::transport::Transport;

/// Serves consumer connections: authorizes requests, forwards them to the
/// broker, and pushes the broker's event stream.
pub struct SessionHost {
    broker: Arc<DispatchBroker>,
    gate: Arc<PairingGate>,
}

impl SessionHost {
    pub fn new(broker: Arc<DispatchBroker>, gate: Arc<PairingGate>) -> Self {
        Self { broker, gate }
    }

    /// Multiplex one connection until the peer closes: inbound requests
    /// are answered in arrival order, events interleave as they happen.
    pub async fn serve<T: Transport>(&self, mut transport: T) {
        let mut events = self.broker.subscribe();
        loop {
            tokio::select! {
                frame = transport.recv() => {
                    let Some(frame) = frame else { break };
                    // Anything other than a request from a consumer is
                    // protocol noise.
                    let Frame::Req { id, kind, payload, token } = frame else {
                        continue;
                    };
                    let response = match self.handle(kind, payload, token).await {
                        Ok(data) => Frame::ok(&id, data),
                        Err(err) => Frame::err(&id, &err),
                    };
                    if transport.send(response).await.is_err() {
                        break;
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if transport.send(Frame::Evt { event }).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Consumer lagging, {} events dropped", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        debug!("Consumer session closed");
    }

    async fn handle(
        &self,
        kind: RequestKind,
        payload: Option<Value>,
        token: Option<String>,
    ) -> Result<Value> {
        if kind.requires_auth() {
            self.gate.validate(token.as_deref())?;
        }

        match kind {
            RequestKind::GetPairCode => Ok(json!({ "code": self.gate.issue_code() })),
            RequestKind::PairConfirm => {
                let payload: PairConfirmPayload = parse_payload(payload)?;
                let token = self.gate.confirm(&payload.code)?;
                Ok(json!({ "token": token }))
            }
            RequestKind::SendMessage => {
                let payload: SendMessagePayload = parse_payload(payload)?;
                let target = resolve_target(&payload.target)?;
                self.broker
                    .dispatch(
                        target,
                        Operation::InjectMessage {
                            text: payload.message,
                        },
                    )
                    .await?;
                Ok(json!({ "success": true }))
            }
            RequestKind::GetResponse => {
                let payload: TargetPayload = parse_payload(payload)?;
                let target = resolve_target(&payload.target)?;
                let content = match self.broker.dispatch(target, Operation::ReadLatest).await {
                    Ok(OpReply::Content(content)) => content,
                    Ok(_) => None,
                    // Live read failed; fall back to the stored value.
                    Err(_) => self.broker.stored_response(target),
                };
                Ok(json!({ "content": content }))
            }
            RequestKind::GetStatus => {
                let statuses: serde_json::Map<String, Value> = self
                    .broker
                    .status()
                    .into_iter()
                    .map(|(target, connected)| (target.name().to_string(), Value::Bool(connected)))
                    .collect();
                Ok(json!({ "statuses": statuses }))
            }
            RequestKind::NewConversation => {
                let payload: NewConversationPayload = parse_payload(payload)?;
                let targets = payload
                    .targets
                    .iter()
                    .map(|name| resolve_target(name))
                    .collect::<Result<Vec<_>>>()?;
                let results = self
                    .broker
                    .fan_out(&targets, Operation::NewConversation)
                    .await;
                let results: serde_json::Map<String, Value> = results
                    .into_iter()
                    .map(|(target, result)| {
                        let entry = match result {
                            Ok(_) => OpResult {
                                success: true,
                                error: None,
                            },
                            Err(err) => OpResult {
                                success: false,
                                error: Some(err.to_string()),
                            },
                        };
                        (
                            target.name().to_string(),
                            serde_json::to_value(entry).unwrap_or(Value::Null),
                        )
                    })
                    .collect();
                Ok(json!({ "results": results }))
            }
        }
    }
}

fn parse_payload<T: DeserializeOwned>(payload: Option<Value>) -> Result<T> {
    let value = payload.ok_or_else(|| Error::Channel("missing payload".into()))?;
    serde_json::from_value(value).map_err(|e| Error::Channel(format!("bad payload: {}", e)))
}
