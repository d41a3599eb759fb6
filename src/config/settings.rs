//! Configuration settings for studysync.
//!
//! Settings are loaded from `config.yaml` in the data directory. Every field
//! has a default, so partial files are fine and a missing file means
//! "all defaults".

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Persistent queue bounds and retention.
    pub queue: QueueConfig,
    /// Retry tuples for each operation class.
    pub retry: RetryConfig,
    /// Remote call settings.
    pub network: NetworkConfig,
}

/// Persistent queue bounds and retention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of items the store may hold (all statuses).
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Maximum number of dead-lettered (`failed`) items kept before enqueue
    /// starts rejecting new work.
    #[serde(default = "default_dead_letter_limit")]
    pub dead_letter_limit: usize,
    /// Age after which an explicit prune removes dead-lettered items.
    #[serde(default = "default_dead_letter_retention_days")]
    pub dead_letter_retention_days: u32,
    /// Age after which an explicit prune removes completed items.
    #[serde(default = "default_completed_retention_hours")]
    pub completed_retention_hours: u32,
}

/// Retry tuple for one operation class.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetryClassConfig {
    /// Number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for any computed delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter applied to each delay, as a fraction (0.2 = ±20%).
    pub jitter_fraction: f64,
}

impl RetryClassConfig {
    /// Delay before the first retry.
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Upper bound for any computed delay.
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Retry tuples for the three operation classes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Data-destroying or user-blocking mutations.
    #[serde(default = "default_critical")]
    pub critical: RetryClassConfig,
    /// Ordinary create/update mutations.
    #[serde(default = "default_normal")]
    pub normal: RetryClassConfig,
    /// Best-effort mutations such as preference sync.
    #[serde(default = "default_background")]
    pub background: RetryClassConfig,
}

/// Remote call settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Timeout applied to every remote invocation.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl NetworkConfig {
    /// Timeout applied to every remote invocation.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// Default value functions for serde
const fn default_capacity() -> usize {
    500
}

const fn default_dead_letter_limit() -> usize {
    200
}

const fn default_dead_letter_retention_days() -> u32 {
    7
}

const fn default_completed_retention_hours() -> u32 {
    24
}

const fn default_request_timeout_secs() -> u64 {
    30
}

const fn default_critical() -> RetryClassConfig {
    RetryClassConfig {
        max_retries: 5,
        base_delay_ms: 1_000,
        max_delay_ms: 60_000,
        jitter_fraction: 0.2,
    }
}

const fn default_normal() -> RetryClassConfig {
    RetryClassConfig {
        max_retries: 3,
        base_delay_ms: 1_000,
        max_delay_ms: 30_000,
        jitter_fraction: 0.2,
    }
}

const fn default_background() -> RetryClassConfig {
    RetryClassConfig {
        max_retries: 1,
        base_delay_ms: 1_000,
        max_delay_ms: 10_000,
        jitter_fraction: 0.1,
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            dead_letter_limit: default_dead_letter_limit(),
            dead_letter_retention_days: default_dead_letter_retention_days(),
            completed_retention_hours: default_completed_retention_hours(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            critical: default_critical(),
            normal: default_normal(),
            background: default_background(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Config {
    /// Load configuration from a specific path.
    ///
    /// If the config file doesn't exist, returns default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load_from_path(path: &Path) -> Result<Self, SyncError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        serde_yaml::from_str(&contents).map_err(|e| {
            SyncError::Config(format!("Failed to parse config file {}: {e}", path.display()))
        })
    }

    /// Save configuration to a specific path.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be written.
    pub fn save_to_path(&self, path: &Path) -> Result<(), SyncError> {
        let contents = serde_yaml::to_string(self)?;

        std::fs::write(path, contents).map_err(|e| {
            SyncError::Config(format!("Failed to write config file {}: {e}", path.display()))
        })
    }
}
