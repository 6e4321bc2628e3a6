//! Error types for queue operations.

use thiserror::Error;

/// Errors surfaced by [`crate::PgmqClient`] and [`crate::PgmqListener`].
#[derive(Debug, Error)]
pub enum PgmqError {
    #[error("invalid queue name '{0}': must be 1-47 chars of [a-zA-Z0-9_]")]
    InvalidQueueName(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
