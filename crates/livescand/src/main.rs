use std::sync::Arc;

use anyhow::{Context, Result};
use livescan_core::EnsemblePipeline;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod server;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "livescand starting");

    let config = config::Config::load().context("failed to load configuration")?;

    // Integrity problems are reported but not fatal; the loader decides what is usable.
    if let Err(e) = livescan_models::verify_models_dir(&config.model_dir, &config.model_files) {
        tracing::warn!(error = %e, "model directory check failed");
    }

    // Models load before the listener binds: no request can observe a half-built ensemble.
    let pipeline = EnsemblePipeline::load(
        &config.model_dir,
        &config.model_files,
        &config.session_options(),
    );
    let engine = engine::spawn_engine(pipeline, config.queue_depth)?;
    let state = Arc::new(server::AppState::new(engine, &config));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "livescand ready");

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("livescand shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
