//! Liveness monitor — probe round-trips and the advisory heartbeat sweep.

use std::sync::Arc;
use std::time::Duration;

use chorus_core::OpReply;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::broker::DispatchBroker;
use crate::listener::{ListenerHandle, ListenerRequest};

/// Ping a listener. No reply within the timeout means dead, not unknown —
/// the system fails closed.
pub async fn probe(handle: &ListenerHandle, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, handle.call(ListenerRequest::Ping)).await,
        Ok(Ok(OpReply::Alive))
    )
}

/// Run the heartbeat sweep on a fixed interval, independent of pending
/// work. Sweep failures are logged and reflected in status events; revival
/// stays on the request path.
pub fn spawn_heartbeat(broker: Arc<DispatchBroker>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(broker.config().heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval fires immediately; the first sweep should wait one period.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            broker.heartbeat_sweep().await;
        }
    })
}
