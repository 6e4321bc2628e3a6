//! Row types returned by queue reads.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;

/// A message read from an active queue.
///
/// `vt` is the instant the message becomes visible to other readers again;
/// until then it is reserved for the caller that read it.
#[derive(Debug, Clone, FromRow)]
pub struct QueueMessage {
    pub msg_id: i64,
    /// Number of times this message has been read (1 on first delivery).
    pub read_ct: i32,
    pub enqueued_at: DateTime<Utc>,
    pub vt: DateTime<Utc>,
    pub message: Value,
}

/// A message row from a queue's archive table (`pgmq.a_<queue>`).
#[derive(Debug, Clone, FromRow)]
pub struct ArchivedMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
    pub message: Value,
}

/// Point-in-time metrics for a single queue.
#[derive(Debug, Clone, FromRow)]
pub struct QueueMetrics {
    pub queue_name: String,
    /// Messages currently visible or reserved in the active queue.
    pub queue_length: i64,
    pub newest_msg_age_sec: Option<i32>,
    pub oldest_msg_age_sec: Option<i32>,
    /// All messages ever enqueued, including deleted and archived ones.
    pub total_messages: i64,
}
