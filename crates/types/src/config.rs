//! Configuration types for the restore engine.
//!
//! Configuration is deserialized from the node's TOML config file. All
//! structs provide serde defaults; post-deserialization validation is
//! available via [`validate`](RestoreConfig::validate).

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Configuration validation error.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// A configuration value is outside its valid range.
    #[snafu(display("invalid config: {message}"))]
    Validation {
        /// Description of the validation failure.
        message: String,
    },
}

/// Maximum permitted session poll interval. The poll interval keeps the
/// coordinator inspectable while it waits; it is not a timeout, so large
/// values only make the operation sluggish to observe, never incorrect.
const MAX_POLL_INTERVAL_MS: u64 = 60_000;

/// Restore engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Bounded poll interval for the session wait loops, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Number of chunks a save-file reader may buffer ahead of consumption.
    #[serde(default = "default_read_ahead_chunks")]
    pub read_ahead_chunks: usize,

    /// Directory receiving duplicate-row sink files in recover mode.
    #[serde(default = "default_duplicate_sink_dir")]
    pub duplicate_sink_dir: PathBuf,

    /// Extra capacity, in percent, granted to repartition output buffers
    /// beyond the `batch_rows / partition_count` estimate.
    #[serde(default = "default_repartition_slack_pct")]
    pub repartition_slack_pct: u32,
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_read_ahead_chunks() -> usize {
    4
}

fn default_duplicate_sink_dir() -> PathBuf {
    PathBuf::from("duplicates")
}

fn default_repartition_slack_pct() -> u32 {
    25
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            read_ahead_chunks: default_read_ahead_chunks(),
            duplicate_sink_dir: default_duplicate_sink_dir(),
            repartition_slack_pct: default_repartition_slack_pct(),
        }
    }
}

impl RestoreConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if a value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 || self.poll_interval_ms > MAX_POLL_INTERVAL_MS {
            return Err(ConfigError::Validation {
                message: format!(
                    "poll_interval_ms must be in 1..={MAX_POLL_INTERVAL_MS}, got {}",
                    self.poll_interval_ms
                ),
            });
        }
        if self.read_ahead_chunks == 0 {
            return Err(ConfigError::Validation {
                message: "read_ahead_chunks must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// The session poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        RestoreConfig::default().validate().unwrap();
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let config = RestoreConfig { poll_interval_ms: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_read_ahead_rejected() {
        let config = RestoreConfig { read_ahead_chunks: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: RestoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.poll_interval_ms, 50);
        assert_eq!(config.read_ahead_chunks, 4);
    }
}
