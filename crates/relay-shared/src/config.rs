//! # Configuration
//!
//! Layered configuration: a TOML file (optional) overridden by
//! `RELAY__`-prefixed environment variables, e.g.
//! `RELAY__DATABASE__MAX_CONNECTIONS=20`.
//!
//! Pool sizing guidance: the database pool is the sole shared resource.
//! Size it for (worker concurrency x workers) + router concurrency + one
//! LISTEN connection per worker/router + headroom for submission.

use std::path::Path;

use serde::Deserialize;

use crate::error::{RelayError, RelayResult};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Per-statement timeout on worker-held connections, so a wedged
    /// handler cannot monopolize a connection.
    #[serde(default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: i32,
    /// Max commands per transaction in bulk submission.
    #[serde(default = "default_chunk_size")]
    pub batch_chunk_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: default_max_attempts(),
            batch_chunk_size: default_chunk_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_seconds: i32,
    #[serde(default = "default_batch_size")]
    pub batch_size: i32,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_seconds: default_visibility_timeout(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RetryConfig {
    /// Fixed per-attempt delays in seconds; takes precedence over the
    /// exponential fields when set.
    pub backoff_schedule: Option<Vec<u64>>,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        match &self.backoff_schedule {
            Some(schedule) => RetryPolicy::with_schedule(schedule.clone()),
            None => RetryPolicy::exponential(
                self.base_delay_ms,
                if self.multiplier > 0.0 {
                    self.multiplier
                } else {
                    default_multiplier()
                },
                self.max_delay_ms,
            ),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_watchdog_interval")]
    pub poll_interval_seconds: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            poll_interval_seconds: default_watchdog_interval(),
        }
    }
}

/// Top-level configuration for a relay node.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    /// Domains this node runs workers (and reply routers) for.
    #[serde(default)]
    pub domains: Vec<String>,
}

impl RelayConfig {
    /// Load configuration from an optional TOML file plus environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> RelayResult<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("RELAY").separator("__"))
            .build()
            .map_err(|e| RelayError::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| RelayError::Config(e.to_string()))
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_statement_timeout_ms() -> u64 {
    25_000
}

fn default_max_attempts() -> i32 {
    3
}

fn default_chunk_size() -> usize {
    1_000
}

fn default_visibility_timeout() -> i32 {
    30
}

fn default_batch_size() -> i32 {
    10
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_true() -> bool {
    true
}

fn default_watchdog_interval() -> u64 {
    10
}
