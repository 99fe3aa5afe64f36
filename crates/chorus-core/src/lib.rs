//! Chorus core — target registry, error taxonomy, configuration, shared types.

pub mod config;
pub mod error;
pub mod targets;
pub mod types;

pub use config::{BrokerConfig, CaptureConfig, ChannelConfig, ChorusConfig};
pub use error::{Error, Result};
pub use targets::Target;
pub use types::{BrokerEvent, OpReply, Operation};
