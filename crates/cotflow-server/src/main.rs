//! HTTP server entry point.
//!
//! Loads settings, wires the default backend connector, and serves the
//! router on the configured bind address.

use std::sync::Arc;

use anyhow::{Context, Result};
use cotflow_config::{EnvCredentials, Settings};
use cotflow_engine::DefaultConnector;
use cotflow_server::{router, ServerState};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".parse().unwrap()),
        )
        .compact()
        .init();

    let settings = Settings::load().context("failed to load settings")?;
    info!(
        "Cloud: {} ({}), local: {}",
        settings.cloud.model, settings.cloud.api_base, settings.local.host
    );

    let connector = DefaultConnector::new(settings.clone(), Arc::new(EnvCredentials));
    let bind = settings.server.bind.clone();
    let state = Arc::new(ServerState::new(settings, Arc::new(connector)));

    let app = router(state);

    info!("Starting server on {}", bind);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    axum::serve(listener, app).await?;

    Ok(())
}
