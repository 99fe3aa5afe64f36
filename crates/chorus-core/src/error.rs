//! Error types for Chorus.
//!
//! The `Display` renderings of `Unauthorized`, `TokenExpired`, `Timeout`
//! and `TargetUnreachable` double as the wire error codes, so the session
//! channel and the error taxonomy cannot drift apart.

use thiserror::Error;

use crate::targets::Target;

#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error: the target id is not in the registry.
    #[error("unknown target: {0}")]
    UnknownTarget(String),

    /// No open tab matched the target's URL patterns.
    #[error("no {0} tab found")]
    TabNotFound(Target),

    /// The listener could not be revived for the current work item.
    #[error("target unreachable")]
    TargetUnreachable,

    /// The send raced a not-yet-ready listener. The only retryable class.
    #[error("listener endpoint does not exist")]
    ListenerGone,

    #[error("request timeout")]
    Timeout,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Token expired")]
    TokenExpired,

    /// The listener ran but the requested page operation failed.
    #[error("{0}")]
    App(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the dispatch broker may retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ListenerGone)
    }

    /// Whether this error must invalidate the consumer's stored token.
    pub fn invalidates_token(&self) -> bool {
        matches!(self, Error::Unauthorized | Error::TokenExpired)
    }

    /// Reconstruct an error from a wire `error` string.
    pub fn from_wire(code: &str) -> Self {
        match code {
            "Unauthorized" => Error::Unauthorized,
            "Token expired" => Error::TokenExpired,
            "request timeout" => Error::Timeout,
            "target unreachable" => Error::TargetUnreachable,
            other => Error::App(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
