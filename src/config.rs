// src/config.rs

use crate::types::Config;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.control.history_capacity == 0 {
            anyhow::bail!("control.history_capacity must be > 0");
        }
        if self.control.rolling_window == 0 {
            anyhow::bail!("control.rolling_window must be > 0");
        }
        if self.junction.phases.green.is_empty() {
            anyhow::bail!("junction.phases must define at least one phase");
        }
        if self.alerts.history_capacity == 0 || self.violations.history_capacity == 0 {
            anyhow::bail!("alert and violation history capacities must be > 0");
        }
        if self.emergency.timeout_secs <= 0.0 {
            anyhow::bail!("emergency.timeout_secs must be positive");
        }
        if self.violations.critical_dwell_secs < self.violations.dwell_threshold_secs {
            anyhow::bail!("violations.critical_dwell_secs must be >= dwell_threshold_secs");
        }
        Ok(())
    }
}
