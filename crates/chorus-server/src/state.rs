//! Shared application state.

use std::sync::Arc;

use chorus_broker::DispatchBroker;
use chorus_channel::PairingGate;
use chorus_core::ChorusConfig;

use crate::relay::RelayHub;

/// Shared state accessible from all route handlers.
pub struct AppState {
    pub config: ChorusConfig,
    pub relay: Arc<RelayHub>,
    pub broker: Arc<DispatchBroker>,
    pub gate: Arc<PairingGate>,
}

impl AppState {
    pub fn new(config: ChorusConfig) -> Self {
        let relay = RelayHub::new();
        let broker = DispatchBroker::new(
            relay.clone(),
            config.broker.clone(),
            config.capture.clone(),
        );
        let gate = Arc::new(PairingGate::new(config.channel.pair_code_ttl()));

        Self {
            config,
            relay,
            broker,
            gate,
        }
    }
}
