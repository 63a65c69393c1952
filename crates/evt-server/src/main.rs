//! Event engine server
//!
//! Loads the engine configuration from `EVT_CONFIG` and scripted events from
//! `EVT_EVENTS` (both YAML, both optional), runs the engine until Ctrl-C.

mod events;

use anyhow::Result;
use evt_engine::{Engine, EngineConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::events::EventFile;

fn load_config() -> Result<EngineConfig> {
    match std::env::var_os("EVT_CONFIG") {
        Some(path) => Ok(EngineConfig::load(path)?),
        None => Ok(EngineConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting event engine server");

    let engine = Engine::new(config)?;
    if let Some(path) = std::env::var_os("EVT_EVENTS") {
        EventFile::load(path)?.register_all(&engine);
    }

    engine.start();
    info!(events = engine.count(), "Event engine is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    engine.stop();

    let stats = engine.stats();
    info!(
        ticks = stats.ticks,
        fires = stats.fires,
        errors = stats.errors,
        "Event engine stopped"
    );
    Ok(())
}
