use std::path::Path;

use qtrade_models::config::{
    ConsolidationConfig, VaultConfig, MAX_GRACE_PERIOD_HOURS, MAX_INTELLIGENCE_WINDOW_DAYS,
};
use serde::{Deserialize, Serialize};

use crate::error::CuratorError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CuratorConfig {
    pub vault: VaultConfig,
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
    /// Seconds between consolidation passes.
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    /// Re-apply every applied auto-apply memory before the first pass.
    #[serde(default = "default_true")]
    pub replay_on_start: bool,
}

impl CuratorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CuratorError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, CuratorError> {
        let config: CuratorConfig =
            toml::from_str(raw).map_err(|e| CuratorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), CuratorError> {
        if self.interval_seconds == 0 {
            return Err(CuratorError::Config(
                "interval_seconds must be greater than zero".to_string(),
            ));
        }
        let grace = self.consolidation.grace_period_hours;
        if !(0..=MAX_GRACE_PERIOD_HOURS).contains(&grace) {
            return Err(CuratorError::Config(format!(
                "grace_period_hours {grace} is outside 0-{MAX_GRACE_PERIOD_HOURS}"
            )));
        }
        let window = self.vault.intelligence_window_days;
        if !(1..=MAX_INTELLIGENCE_WINDOW_DAYS).contains(&window) {
            return Err(CuratorError::Config(format!(
                "intelligence_window_days {window} is outside 1-{MAX_INTELLIGENCE_WINDOW_DAYS}"
            )));
        }
        let threshold = self.consolidation.similarity_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(CuratorError::Config(format!(
                "similarity_threshold {threshold} is outside 0.0-1.0"
            )));
        }
        Ok(())
    }
}

fn default_interval() -> u64 {
    3600
}
fn default_true() -> bool {
    true
}
