//! # relay-shared
//!
//! Shared building blocks for the relay command bus: domain models and
//! status enums, the error taxonomy, the retry policy, per-worker health
//! tracking, configuration loading, and the embedded database migrations.

pub mod config;
pub mod error;
pub mod health;
pub mod models;
pub mod queues;
pub mod retry;

pub use config::RelayConfig;
pub use error::{RelayError, RelayResult};
pub use health::{HealthSnapshot, HealthState, HealthStatus};
pub use retry::{Backoff, RetryPolicy};

/// Embedded migrations: command/audit/batch tables, lifecycle and batch
/// counter procedures, process tables. Run with
/// `MIGRATOR.run(&pool).await` before the bus or workers start.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
