//! Shared operation and event types.

use serde::{Deserialize, Serialize};

use crate::targets::Target;

/// Operations the broker forwards to a per-target listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Type the text into the target's composer and submit it.
    InjectMessage { text: String },
    /// Extract the most recent reply from the live page.
    ReadLatest,
    /// Start a fresh conversation in the tab.
    NewConversation,
    /// Liveness ping.
    StatusProbe,
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InjectMessage { .. } => "inject_message",
            Self::ReadLatest => "read_latest",
            Self::NewConversation => "new_conversation",
            Self::StatusProbe => "status_probe",
        }
    }
}

/// Successful listener replies, one shape per operation kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpReply {
    /// Message accepted by the page.
    Sent,
    /// Latest extracted reply, if any.
    Content(Option<String>),
    /// New conversation started.
    Started,
    /// Listener answered the ping.
    Alive,
}

/// Unsolicited events pushed to session-channel consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BrokerEvent {
    #[serde(rename = "TAB_STATUS_UPDATE")]
    TabStatusUpdate { target: Target, connected: bool },
    #[serde(rename = "RESPONSE_CAPTURED")]
    ResponseCaptured { target: Target, content: String },
    #[serde(rename = "SEND_RESULT")]
    SendResult {
        target: Target,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl BrokerEvent {
    pub fn target(&self) -> Target {
        match self {
            Self::TabStatusUpdate { target, .. }
            | Self::ResponseCaptured { target, .. }
            | Self::SendResult { target, .. } => *target,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_tags() {
        let op = Operation::InjectMessage {
            text: "hello".into(),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "inject_message");
        assert_eq!(json["text"], "hello");

        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = BrokerEvent::ResponseCaptured {
            target: Target::Claude,
            content: "the answer".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "RESPONSE_CAPTURED");
        assert_eq!(json["data"]["target"], "claude");
        assert_eq!(json["data"]["content"], "the answer");
    }

    #[test]
    fn test_send_result_omits_absent_error() {
        let event = BrokerEvent::SendResult {
            target: Target::Gemini,
            success: true,
            error: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json["data"].get("error").is_none());
    }
}
