// src/main.rs

use anyhow::Result;
use junction_control::pipeline::{ControlLoop, TrafficCore};
use junction_control::Config;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = Config::load(&config_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚦 Junction control starting: {}", config.junction.name);
    info!("✓ Configuration loaded from {}", config_path);
    info!(
        "Tick {} ms, step timeout {} ms, {} phases, max {} steps",
        config.control.tick_interval_ms,
        config.control.step_timeout_ms,
        config.junction.phases.phase_count(),
        config.simulation.max_steps
    );

    let max_steps = config.simulation.max_steps;
    let core = Arc::new(TrafficCore::from_config(config));
    if !core.engine.is_operational() {
        warn!("Decision models unavailable; every tick will hold the current phase");
    }

    let handle = ControlLoop::new(core.clone())
        .with_max_steps(max_steps)
        .spawn();

    let outcome = handle.join_or_ctrl_c().await?;

    info!("Run finished: {} steps ({})", outcome.steps, outcome.reason);

    for event in core.drain_events() {
        info!("event: {}", serde_json::to_string(&event)?);
    }
    info!(
        "📊 Metrics: {}",
        serde_json::to_string_pretty(&core.metrics.summary())?
    );
    info!(
        "📋 Status: {}",
        serde_json::to_string_pretty(&core.status_report())?
    );

    match outcome.error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
