//! Process-manager state: a long-running saga advanced by reply routing.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RelayError;
use crate::models::command::CommandError;
use crate::models::envelope::ReplyOutcome;

/// Lifecycle status of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    Pending,
    InProgress,
    WaitingForReply,
    Completed,
    Failed,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::WaitingForReply => "WAITING_FOR_REPLY",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "WAITING_FOR_REPLY" => Ok(Self::WaitingForReply),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(RelayError::decode(format!(
                "unknown process status '{other}'"
            ))),
        }
    }
}

/// Durable state of a process, addressed by (domain, process_id).
///
/// While WAITING_FOR_REPLY exactly one command is in flight, and its
/// correlation_id equals the process_id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessMetadata {
    pub domain: String,
    pub process_id: Uuid,
    pub process_type: String,
    pub status: ProcessStatus,
    pub current_step: Option<String>,
    pub state: Value,
    pub last_error: Option<CommandError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub batch_id: Option<Uuid>,
}

/// One entry in a process's append-only step trail: the command issued for
/// the step and, once routed, the reply that answered it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStepRecord {
    pub step_id: i64,
    pub domain: String,
    pub process_id: Uuid,
    pub step_name: String,
    pub command_id: Uuid,
    pub command_type: String,
    pub command_data: Option<Value>,
    pub sent_at: DateTime<Utc>,
    pub reply_outcome: Option<ReplyOutcome>,
    pub reply_data: Option<Value>,
    pub received_at: Option<DateTime<Utc>>,
}
