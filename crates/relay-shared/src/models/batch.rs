//! Batch aggregates: a named group of commands submitted atomically, with
//! counters mutated exclusively by stored procedures.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RelayError;

/// Aggregate status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    InProgress,
    Completed,
    CompletedWithFailures,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::CompletedWithFailures => "COMPLETED_WITH_FAILURES",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::CompletedWithFailures)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "COMPLETED_WITH_FAILURES" => Ok(Self::CompletedWithFailures),
            other => Err(RelayError::decode(format!("unknown batch status '{other}'"))),
        }
    }
}

/// A follow-up command fired when a batch reaches a terminal status.
///
/// Persisted on the batch row at creation time, so completion intent
/// survives restarts; the transaction that flips the batch terminal
/// enqueues this command atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionCommand {
    pub command_type: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// Durable metadata for a batch, addressed by (domain, batch_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub domain: String,
    pub batch_id: Uuid,
    pub name: Option<String>,
    pub custom_data: Option<Value>,
    pub status: BatchStatus,
    /// Number of commands the batch was created with; never changes.
    pub total_count: i32,
    pub completed_count: i32,
    pub failed_count: i32,
    pub canceled_count: i32,
    pub in_troubleshooting_count: i32,
    pub completion_command: Option<CompletionCommand>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One command inside a batch-create request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCommand {
    pub command_type: String,
    pub command_id: Uuid,
    pub data: Value,
    pub correlation_id: Option<Uuid>,
    pub reply_to: Option<String>,
    /// Overrides the bus default when set.
    pub max_attempts: Option<i32>,
}

impl BatchCommand {
    pub fn new(command_type: impl Into<String>, command_id: Uuid, data: Value) -> Self {
        Self {
            command_type: command_type.into(),
            command_id,
            data,
            correlation_id: None,
            reply_to: None,
            max_attempts: None,
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}
