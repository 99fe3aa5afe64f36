//! Dispatch broker — resolves targets to tabs, keeps per-target listeners
//! alive, forwards work with bounded retries, and fans results out to the
//! session channel's event stream.

pub mod broker;
pub mod driver;
pub mod listener;
pub mod liveness;
pub mod tabs;

pub use broker::DispatchBroker;
pub use driver::TabDriver;
pub use listener::{spawn_listener, ListenerHandle, ListenerRequest};
pub use tabs::{find_tab, TabHost, TabInfo};
