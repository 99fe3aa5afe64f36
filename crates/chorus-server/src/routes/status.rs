//! Daemon status route.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let targets: serde_json::Map<String, Value> = state
        .broker
        .status()
        .into_iter()
        .map(|(target, connected)| (target.name().to_string(), Value::Bool(connected)))
        .collect();

    Json(json!({
        "targets": targets,
        "paired": state.gate.is_paired(),
        "agentConnected": state.relay.is_connected(),
        "time": chrono::Utc::now().to_rfc3339(),
    }))
}
