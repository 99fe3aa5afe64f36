//! Session channel — the authenticated, multiplexed connection between an
//! external consumer and the dispatch broker.
//!
//! One transport carries many concurrent request/response exchanges
//! (correlated by id) plus a server-push event stream. Consumers bind to
//! the broker once via a short pairing code and hold a long-lived token
//! from then on.

pub mod client;
pub mod frame;
pub mod pairing;
pub mod session;
pub mod transport;

pub use client::{ChannelClient, ChannelState, TokenStore};
pub use frame::{Frame, OpResult, RequestKind};
pub use pairing::PairingGate;
pub use session::SessionHost;
pub use transport::{duplex, DuplexTransport, Transport, WsTransport};
