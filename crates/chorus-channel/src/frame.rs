//! Wire frames for the session channel.
//!
//! Requests and responses are correlated by id; events carry none. The
//! whole surface is closed tagged unions so an unknown kind is a parse
//! error at the boundary, not a fall-through at a dispatch site.

use chorus_core::{BrokerEvent, Target};
use serde::{Deserialize, Serialize};

/// Request kinds a consumer may issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestKind {
    GetPairCode,
    PairConfirm,
    SendMessage,
    GetResponse,
    GetStatus,
    NewConversation,
}

impl RequestKind {
    /// Pairing requests are the only ones that run without a token.
    pub fn requires_auth(&self) -> bool {
        !matches!(self, Self::GetPairCode | Self::PairConfirm)
    }
}

/// One channel frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Frame {
    #[serde(rename = "REQ")]
    Req {
        id: String,
        #[serde(rename = "type")]
        kind: RequestKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    #[serde(rename = "RES")]
    Res {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "EVT")]
    Evt {
        #[serde(flatten)]
        event: BrokerEvent,
    },
}

impl Frame {
    pub fn ok(id: &str, data: serde_json::Value) -> Self {
        Frame::Res {
            id: id.to_string(),
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(id: &str, error: &chorus_core::Error) -> Self {
        Frame::Res {
            id: id.to_string(),
            ok: false,
            data: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairConfirmPayload {
    pub code: String,
}

/// Target names arrive as strings and are resolved against the registry at
/// the boundary, so an unknown id surfaces as a configuration error rather
/// than a parse failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessagePayload {
    pub target: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetPayload {
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewConversationPayload {
    pub targets: Vec<String>,
}

/// Resolve a wire target name.
pub fn resolve_target(name: &str) -> Result<Target, chorus_core::Error> {
    Target::from_name(name).ok_or_else(|| chorus_core::Error::UnknownTarget(name.to_string()))
}

/// Per-target outcome of a fanned-out operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
