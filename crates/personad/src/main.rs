use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use dbus_interface::{AnalyzerService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("personad starting");

    let config = config::Config::load().context("failed to load configuration")?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        labels = ?config.labels,
        backends = ?config.backends.iter().map(|b| b.id()).collect::<Vec<_>>(),
        max_workers = config.max_workers,
        policy = ?config.candidate_policy,
        "configuration loaded"
    );

    let engine = Arc::new(engine::Engine::from_config(&config)?);

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AnalyzerService::new(engine))?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "personad ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("personad shutting down");

    Ok(())
}
