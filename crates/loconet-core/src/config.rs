//! Slot manager configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to access config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Timing and command-station settings for a [`SlotManager`](crate::SlotManager).
///
/// Every field has a default, so a TOML file only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Wait for a programming LACK.
    pub short_timeout_ms: u64,
    /// Wait for a service-mode read or confirm to come back from the decoder.
    pub long_timeout_ms: u64,
    /// Grace period before the first stale-slot sweep.
    pub stale_check_initial_delay_ms: u64,
    pub stale_check_interval_ms: u64,
    /// An in-use slot with no update for this long is re-read.
    pub stale_threshold_ms: u64,
    /// Delay before track power is restored after service-mode programming.
    pub power_restore_delay_ms: u64,
    /// Delay before a service-mode result is handed to its requester.
    pub service_reply_delay_ms: u64,
    /// Delay before an ops-mode result is handed to its requester.
    pub ops_reply_delay_ms: u64,
    /// Delay before a blind-accepted task is reported complete.
    pub blind_completion_delay_ms: u64,
    /// Spacing of slot reads during a full table refresh.
    pub refresh_interval_ms: u64,
    /// The command station turns track power off while programming.
    pub prog_powers_off: bool,
    /// The command station can read CVs back.
    pub can_read: bool,
    pub command_station_type: String,
    /// Runtime driver poll interval.
    pub tick_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            short_timeout_ms: 2_000,
            long_timeout_ms: 180_000,
            stale_check_initial_delay_ms: 30_000,
            stale_check_interval_ms: 10_000,
            stale_threshold_ms: 90_000,
            power_restore_delay_ms: 2_000,
            service_reply_delay_ms: 20,
            ops_reply_delay_ms: 100,
            blind_completion_delay_ms: 100,
            refresh_interval_ms: 500,
            prog_powers_off: false,
            can_read: true,
            command_station_type: "<unknown>".to_string(),
            tick_ms: 10,
        }
    }
}

impl ManagerConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ManagerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.long_timeout_ms < self.short_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "long_timeout_ms ({}) is shorter than short_timeout_ms ({})",
                self.long_timeout_ms, self.short_timeout_ms
            )));
        }
        if self.stale_check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "stale_check_interval_ms must be positive".to_string(),
            ));
        }
        if self.tick_ms == 0 {
            return Err(ConfigError::Invalid("tick_ms must be positive".to_string()));
        }
        Ok(())
    }

    /// Repair the settings [`validate`](Self::validate) rejects: zero
    /// intervals become 1 ms and the long timeout is raised to the short one.
    pub fn normalized(mut self) -> Self {
        self.tick_ms = self.tick_ms.max(1);
        self.stale_check_interval_ms = self.stale_check_interval_ms.max(1);
        self.long_timeout_ms = self.long_timeout_ms.max(self.short_timeout_ms);
        self
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}
