//! Engine configuration types.
//!
//! `EngineConfig` represents the `config.toml` in the data directory that
//! controls retry budgets, per-attempt timeouts and scheduler limits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
///
/// Loaded from `{data_dir}/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum attempts per node before a failure becomes terminal.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound for any single backoff delay, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Growth factor applied to the backoff after each failed attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Watchdog for a single attempt of a node body, in seconds.
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,

    /// Cap on node bodies executing at once across all runs of one engine.
    /// `None` means unbounded.
    #[serde(default)]
    pub max_concurrent_nodes: Option<usize>,

    /// Listener calls slower than this are logged.
    #[serde(default = "default_slow_listener_warn_ms")]
    pub slow_listener_warn_ms: u64,

    /// SQLite URL for the durability store. Falls back to the data directory.
    #[serde(default)]
    pub database_url: Option<String>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_attempt_timeout_secs() -> u64 {
    600
}

fn default_slow_listener_warn_ms() -> u64 {
    250
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            max_concurrent_nodes: None,
            slow_listener_warn_ms: default_slow_listener_warn_ms(),
            database_url: None,
        }
    }
}

impl EngineConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn slow_listener_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_listener_warn_ms)
    }
}
