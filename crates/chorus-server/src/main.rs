//! Chorus — broadcast one prompt to every open chat tab, collect the replies.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

mod relay;
mod routes;
mod state;

use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = chorus_core::ChorusConfig::from_env();
    let port = config.port;

    let state = Arc::new(AppState::new(config));

    // Advisory heartbeat sweep, independent of any pending work.
    chorus_broker::liveness::spawn_heartbeat(state.broker.clone());

    let app = routes::build_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Chorus daemon listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
