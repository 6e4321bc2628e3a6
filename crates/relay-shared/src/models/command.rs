//! Command metadata, statuses and submission request/result types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RelayError;

/// Lifecycle status of a command.
///
/// COMPLETED, FAILED and CANCELED are terminal; once reached no event
/// transitions the command back to a non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Canceled,
    InTroubleshootingQueue,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
            Self::InTroubleshootingQueue => "IN_TROUBLESHOOTING_QUEUE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELED" => Ok(Self::Canceled),
            "IN_TROUBLESHOOTING_QUEUE" => Ok(Self::InTroubleshootingQueue),
            other => Err(RelayError::decode(format!(
                "unknown command status '{other}'"
            ))),
        }
    }
}

/// Classification of a handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Worth retrying up to max_attempts with backoff.
    Transient,
    /// Unrecoverable; the command goes to the troubleshooting queue.
    Permanent,
    /// Domain-level rejection; an expected negative outcome, no retry.
    BusinessRule,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "TRANSIENT",
            Self::Permanent => "PERMANENT",
            Self::BusinessRule => "BUSINESS_RULE",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRANSIENT" => Ok(Self::Transient),
            "PERMANENT" => Ok(Self::Permanent),
            "BUSINESS_RULE" => Ok(Self::BusinessRule),
            other => Err(RelayError::decode(format!("unknown error kind '{other}'"))),
        }
    }
}

/// The last recorded failure of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
}

impl CommandError {
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Durable metadata for a single command, addressed by (domain, command_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMetadata {
    pub domain: String,
    pub command_id: Uuid,
    pub command_type: String,
    pub status: CommandStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub msg_id: Option<i64>,
    pub correlation_id: Option<Uuid>,
    pub reply_to: Option<String>,
    pub last_error: Option<CommandError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub batch_id: Option<Uuid>,
}

/// A single submission for [`send_batch`](crate::models::SendRequest).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub domain: String,
    pub command_type: String,
    pub command_id: Uuid,
    pub data: Value,
    pub correlation_id: Option<Uuid>,
    pub reply_to: Option<String>,
    pub max_attempts: Option<i32>,
    pub batch_id: Option<Uuid>,
}

impl SendRequest {
    pub fn new(
        domain: impl Into<String>,
        command_type: impl Into<String>,
        command_id: Uuid,
        data: Value,
    ) -> Self {
        Self {
            domain: domain.into(),
            command_type: command_type.into(),
            command_id,
            data,
            correlation_id: None,
            reply_to: None,
            max_attempts: None,
            batch_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_batch_id(mut self, batch_id: Uuid) -> Self {
        self.batch_id = Some(batch_id);
        self
    }
}

/// Outcome of a single submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub command_id: Uuid,
    pub msg_id: i64,
}

/// Aggregate outcome of a bulk submission.
#[derive(Debug, Clone, Default)]
pub struct BatchSendResult {
    pub results: Vec<SendResult>,
    pub chunks_processed: usize,
    pub total_commands: usize,
}

/// Filters for querying stored commands; results are ordered by
/// created_at descending.
#[derive(Debug, Clone, Default)]
pub struct CommandQuery {
    pub status: Option<CommandStatus>,
    pub domain: Option<String>,
    pub command_type: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl CommandQuery {
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }
}
