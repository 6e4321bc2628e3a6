//! # Error Taxonomy
//!
//! Typed errors for every caller-facing precondition plus transparent
//! wrappers for infrastructure failures. Worker-internal handler failures
//! are NOT represented here -- those are classified outcomes (see the
//! worker crate), never surfaced as bus errors.

use thiserror::Error;
use uuid::Uuid;

/// Result alias used across the relay crates.
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors surfaced by the command bus, repositories and operator surfaces.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A command with this (domain, command_id) already exists. Submission
    /// idempotency is scoped per domain.
    #[error("duplicate command {command_id} in domain '{domain}'")]
    DuplicateCommand { domain: String, command_id: Uuid },

    /// A submission referenced a batch that does not exist.
    #[error("batch {batch_id} not found in domain '{domain}'")]
    BatchNotFound { domain: String, batch_id: Uuid },

    /// An operator acted on a command that does not exist.
    #[error("command {command_id} not found in domain '{domain}'")]
    CommandNotFound { domain: String, command_id: Uuid },

    /// A reply or runtime call referenced an unknown process.
    #[error("process {process_id} not found in domain '{domain}'")]
    ProcessNotFound { domain: String, process_id: Uuid },

    /// An operator action whose precondition is false (wrong status,
    /// missing archived payload for a retry, ...).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A stored row could not be decoded into a model (unknown status
    /// string, malformed json column, ...).
    #[error("failed to decode stored value: {0}")]
    Decode(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("queue error: {0}")]
    Queue(#[from] relay_pgmq::PgmqError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    pub fn duplicate_command(domain: impl Into<String>, command_id: Uuid) -> Self {
        Self::DuplicateCommand {
            domain: domain.into(),
            command_id,
        }
    }

    pub fn batch_not_found(domain: impl Into<String>, batch_id: Uuid) -> Self {
        Self::BatchNotFound {
            domain: domain.into(),
            batch_id,
        }
    }

    pub fn command_not_found(domain: impl Into<String>, command_id: Uuid) -> Self {
        Self::CommandNotFound {
            domain: domain.into(),
            command_id,
        }
    }

    pub fn process_not_found(domain: impl Into<String>, process_id: Uuid) -> Self {
        Self::ProcessNotFound {
            domain: domain.into(),
            process_id,
        }
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }
}
