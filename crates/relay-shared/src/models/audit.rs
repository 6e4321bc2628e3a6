//! Append-only audit trail types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RelayError;

/// Lifecycle events recorded for every command. Rows are never mutated or
/// deleted for active commands; within one (domain, command_id) they are
/// totally ordered by audit_id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    Sent,
    Received,
    Completed,
    Failed,
    BusinessRuleFailed,
    RetryScheduled,
    RetryExhausted,
    MovedToTsq,
    OperatorRetry,
    OperatorCancel,
    OperatorComplete,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "SENT",
            Self::Received => "RECEIVED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::BusinessRuleFailed => "BUSINESS_RULE_FAILED",
            Self::RetryScheduled => "RETRY_SCHEDULED",
            Self::RetryExhausted => "RETRY_EXHAUSTED",
            Self::MovedToTsq => "MOVED_TO_TSQ",
            Self::OperatorRetry => "OPERATOR_RETRY",
            Self::OperatorCancel => "OPERATOR_CANCEL",
            Self::OperatorComplete => "OPERATOR_COMPLETE",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditEventType {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SENT" => Ok(Self::Sent),
            "RECEIVED" => Ok(Self::Received),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "BUSINESS_RULE_FAILED" => Ok(Self::BusinessRuleFailed),
            "RETRY_SCHEDULED" => Ok(Self::RetryScheduled),
            "RETRY_EXHAUSTED" => Ok(Self::RetryExhausted),
            "MOVED_TO_TSQ" => Ok(Self::MovedToTsq),
            "OPERATOR_RETRY" => Ok(Self::OperatorRetry),
            "OPERATOR_CANCEL" => Ok(Self::OperatorCancel),
            "OPERATOR_COMPLETE" => Ok(Self::OperatorComplete),
            other => Err(RelayError::decode(format!(
                "unknown audit event type '{other}'"
            ))),
        }
    }
}

/// A single audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub audit_id: i64,
    pub domain: String,
    pub command_id: Uuid,
    pub event_type: AuditEventType,
    pub occurred_at: DateTime<Utc>,
    pub details: Option<Value>,
}
