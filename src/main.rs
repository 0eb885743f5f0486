// =============================================================================
// kline-gateway - Main Entry Point
// =============================================================================
//
// Turns a pull-only A-share quote feed into a push-based candlestick stream:
// WebSocket subscriptions for live multi-period bars, plus a cached HTTP
// history endpoint. Construction order matters: settings, provider, shared
// state (clock/hub/poller/cache), then the poller and the HTTP server.
// =============================================================================

mod api;
mod builder;
mod cache;
mod clock;
mod config;
mod history;
mod hub;
mod poller;
mod provider;
mod state;
mod types;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::provider::eastmoney::{EastmoneyConfig, EastmoneyProvider};
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("kline-gateway starting up");

    // Configuration problems are fatal here, before anything is listening.
    let settings = Settings::from_env().context("invalid configuration")?;
    info!(
        timezone = settings.timezone.name(),
        cache_backend = %settings.cache_backend,
        poll_interval = settings.snapshot_poll_interval_seconds,
        "configuration loaded"
    );

    let provider = Arc::new(
        EastmoneyProvider::new(settings.timezone, EastmoneyConfig::default())
            .context("failed to construct market data provider")?,
    );
    let state = AppState::build(settings, provider).await?;

    state.poller.start();

    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&state.settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", state.settings.bind_addr))?;
    info!(addr = %state.settings.bind_addr, "API server listening");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    warn!("shutdown signal received, stopping gracefully");

    state.poller.stop().await;
    info!("kline-gateway shut down complete");
    Ok(())
}
