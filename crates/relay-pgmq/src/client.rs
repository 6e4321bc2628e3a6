//! # PGMQ Client
//!
//! Thin client over the pgmq extension's SQL surface. All operations run
//! against a caller-supplied executor: the pool-scoped methods are
//! conveniences for one-shot calls, while the `*_in` variants participate in
//! an externally-managed transaction.

use std::time::Duration;

use serde_json::Value;
use sqlx::postgres::{PgConnection, PgExecutor, PgPool};
use tracing::debug;

use crate::error::PgmqError;
use crate::types::{ArchivedMessage, QueueMessage, QueueMetrics};

/// pgmq rejects queue names longer than 47 characters (the archive table
/// prefix must still fit in an identifier).
const MAX_QUEUE_NAME_LEN: usize = 47;

/// Validate a queue name before it is interpolated into archive-table
/// identifiers or passed to extension functions.
fn validate_queue_name(queue_name: &str) -> Result<(), PgmqError> {
    let valid = !queue_name.is_empty()
        && queue_name.len() <= MAX_QUEUE_NAME_LEN
        && queue_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(PgmqError::InvalidQueueName(queue_name.to_string()))
    }
}

/// Client for the pgmq Postgres extension.
///
/// Cloneable; holds only a connection pool.
#[derive(Debug, Clone)]
pub struct PgmqClient {
    pool: PgPool,
}

impl PgmqClient {
    /// Create a client over an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create a queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<(), PgmqError> {
        validate_queue_name(queue_name)?;
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(&self.pool)
            .await?;
        debug!(queue = %queue_name, "Queue created");
        Ok(())
    }

    /// Drop a queue and its archive.
    pub async fn drop_queue(&self, queue_name: &str) -> Result<bool, PgmqError> {
        validate_queue_name(queue_name)?;
        let dropped: bool = sqlx::query_scalar("SELECT pgmq.drop_queue($1)")
            .bind(queue_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(dropped)
    }

    /// Delete all messages from a queue, returning the number removed.
    pub async fn purge_queue(&self, queue_name: &str) -> Result<i64, PgmqError> {
        validate_queue_name(queue_name)?;
        let purged: i64 = sqlx::query_scalar("SELECT pgmq.purge_queue($1)")
            .bind(queue_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(purged)
    }

    // -------------------------------------------------------------------
    // Enqueue
    // -------------------------------------------------------------------

    /// Enqueue a message, immediately visible.
    pub async fn send(&self, queue_name: &str, payload: &Value) -> Result<i64, PgmqError> {
        send_on(&self.pool, queue_name, payload, 0).await
    }

    /// Enqueue a message that becomes visible after `delay_seconds`.
    pub async fn send_with_delay(
        &self,
        queue_name: &str,
        payload: &Value,
        delay_seconds: i32,
    ) -> Result<i64, PgmqError> {
        send_on(&self.pool, queue_name, payload, delay_seconds).await
    }

    /// Enqueue within a caller-owned transaction.
    pub async fn send_in(
        &self,
        conn: &mut PgConnection,
        queue_name: &str,
        payload: &Value,
    ) -> Result<i64, PgmqError> {
        send_on(&mut *conn, queue_name, payload, 0).await
    }

    /// Enqueue with a visibility delay within a caller-owned transaction.
    pub async fn send_with_delay_in(
        &self,
        conn: &mut PgConnection,
        queue_name: &str,
        payload: &Value,
        delay_seconds: i32,
    ) -> Result<i64, PgmqError> {
        send_on(&mut *conn, queue_name, payload, delay_seconds).await
    }

    /// Enqueue a batch of messages, order-preserving.
    pub async fn send_batch(
        &self,
        queue_name: &str,
        payloads: &[Value],
    ) -> Result<Vec<i64>, PgmqError> {
        send_batch_on(&self.pool, queue_name, payloads).await
    }

    /// Enqueue a batch within a caller-owned transaction.
    pub async fn send_batch_in(
        &self,
        conn: &mut PgConnection,
        queue_name: &str,
        payloads: &[Value],
    ) -> Result<Vec<i64>, PgmqError> {
        send_batch_on(&mut *conn, queue_name, payloads).await
    }

    // -------------------------------------------------------------------
    // Read
    // -------------------------------------------------------------------

    /// Read up to `batch_size` messages, reserving each for
    /// `visibility_timeout` seconds.
    pub async fn read(
        &self,
        queue_name: &str,
        visibility_timeout: i32,
        batch_size: i32,
    ) -> Result<Vec<QueueMessage>, PgmqError> {
        validate_queue_name(queue_name)?;
        let messages = sqlx::query_as::<_, QueueMessage>(
            "SELECT msg_id, read_ct, enqueued_at, vt, message \
             FROM pgmq.read($1, $2, $3)",
        )
        .bind(queue_name)
        .bind(visibility_timeout)
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    /// Read repeatedly until at least one message arrives or `max_wait`
    /// elapses. Returns an empty vec on deadline.
    pub async fn read_with_poll(
        &self,
        queue_name: &str,
        visibility_timeout: i32,
        batch_size: i32,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> Result<Vec<QueueMessage>, PgmqError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let messages = self
                .read(queue_name, visibility_timeout, batch_size)
                .await?;
            if !messages.is_empty() || tokio::time::Instant::now() >= deadline {
                return Ok(messages);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Read and delete a single message in one call.
    pub async fn pop(&self, queue_name: &str) -> Result<Option<QueueMessage>, PgmqError> {
        validate_queue_name(queue_name)?;
        let message = sqlx::query_as::<_, QueueMessage>(
            "SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.pop($1)",
        )
        .bind(queue_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(message)
    }

    // -------------------------------------------------------------------
    // Acknowledge / defer
    // -------------------------------------------------------------------

    /// Delete a message. Returns false if it no longer exists.
    pub async fn delete(&self, queue_name: &str, msg_id: i64) -> Result<bool, PgmqError> {
        delete_on(&self.pool, queue_name, msg_id).await
    }

    /// Delete within a caller-owned transaction.
    pub async fn delete_in(
        &self,
        conn: &mut PgConnection,
        queue_name: &str,
        msg_id: i64,
    ) -> Result<bool, PgmqError> {
        delete_on(&mut *conn, queue_name, msg_id).await
    }

    /// Move a message to the queue's archive table. Returns false if it no
    /// longer exists in the active queue.
    pub async fn archive(&self, queue_name: &str, msg_id: i64) -> Result<bool, PgmqError> {
        archive_on(&self.pool, queue_name, msg_id).await
    }

    /// Archive within a caller-owned transaction.
    pub async fn archive_in(
        &self,
        conn: &mut PgConnection,
        queue_name: &str,
        msg_id: i64,
    ) -> Result<bool, PgmqError> {
        archive_on(&mut *conn, queue_name, msg_id).await
    }

    /// Reset a message's visibility timeout to `seconds` from now.
    ///
    /// Used both to extend a reservation and to defer redelivery (retry
    /// backoff). Returns false if the message no longer exists.
    pub async fn set_visibility(
        &self,
        queue_name: &str,
        msg_id: i64,
        seconds: i32,
    ) -> Result<bool, PgmqError> {
        set_visibility_on(&self.pool, queue_name, msg_id, seconds).await
    }

    /// Set visibility within a caller-owned transaction.
    pub async fn set_visibility_in(
        &self,
        conn: &mut PgConnection,
        queue_name: &str,
        msg_id: i64,
        seconds: i32,
    ) -> Result<bool, PgmqError> {
        set_visibility_on(&mut *conn, queue_name, msg_id, seconds).await
    }

    // -------------------------------------------------------------------
    // Notify
    // -------------------------------------------------------------------

    /// Emit a wake-up on the channel named after the queue.
    ///
    /// NOTIFY payloads are delivered at commit, so calling this inside a
    /// transaction (via [`PgmqClient::notify_in`]) makes the wake-up
    /// coincide with message visibility. Delivery is not guaranteed;
    /// consumers must keep a fallback poll.
    pub async fn notify(&self, queue_name: &str) -> Result<(), PgmqError> {
        notify_on(&self.pool, queue_name).await
    }

    /// Notify within a caller-owned transaction (delivered at commit).
    pub async fn notify_in(
        &self,
        conn: &mut PgConnection,
        queue_name: &str,
    ) -> Result<(), PgmqError> {
        notify_on(&mut *conn, queue_name).await
    }

    // -------------------------------------------------------------------
    // Archive access / introspection
    // -------------------------------------------------------------------

    /// Fetch a message from the queue's archive table.
    pub async fn archived_message(
        &self,
        queue_name: &str,
        msg_id: i64,
    ) -> Result<Option<ArchivedMessage>, PgmqError> {
        archived_message_on(&self.pool, queue_name, msg_id).await
    }

    /// Fetch an archived message within a caller-owned transaction.
    pub async fn archived_message_in(
        &self,
        conn: &mut PgConnection,
        queue_name: &str,
        msg_id: i64,
    ) -> Result<Option<ArchivedMessage>, PgmqError> {
        archived_message_on(&mut *conn, queue_name, msg_id).await
    }

    /// Point-in-time metrics for a queue.
    pub async fn queue_metrics(&self, queue_name: &str) -> Result<QueueMetrics, PgmqError> {
        validate_queue_name(queue_name)?;
        let metrics = sqlx::query_as::<_, QueueMetrics>(
            "SELECT queue_name, queue_length, newest_msg_age_sec, \
             oldest_msg_age_sec, total_messages \
             FROM pgmq.metrics($1)",
        )
        .bind(queue_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(metrics)
    }

    /// Verify connectivity with a trivial round-trip.
    pub async fn health_check(&self) -> Result<bool, PgmqError> {
        let one: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(one == 1)
    }
}

// ---------------------------------------------------------------------------
// Executor-generic implementations shared by pool and transaction variants
// ---------------------------------------------------------------------------

async fn send_on<'e, E>(
    executor: E,
    queue_name: &str,
    payload: &Value,
    delay_seconds: i32,
) -> Result<i64, PgmqError>
where
    E: PgExecutor<'e>,
{
    validate_queue_name(queue_name)?;
    let msg_id: i64 = sqlx::query_scalar("SELECT pgmq.send($1, $2, $3)")
        .bind(queue_name)
        .bind(payload)
        .bind(delay_seconds)
        .fetch_one(executor)
        .await?;
    debug!(queue = %queue_name, msg_id, "Message enqueued");
    Ok(msg_id)
}

async fn send_batch_on<'e, E>(
    executor: E,
    queue_name: &str,
    payloads: &[Value],
) -> Result<Vec<i64>, PgmqError>
where
    E: PgExecutor<'e>,
{
    validate_queue_name(queue_name)?;
    if payloads.is_empty() {
        return Ok(Vec::new());
    }
    // Bind one jsonb array and unnest server-side; jsonb_array_elements
    // preserves order, as does pgmq.send_batch.
    let wrapped = Value::Array(payloads.to_vec());
    let msg_ids: Vec<i64> = sqlx::query_scalar(
        "SELECT pgmq.send_batch($1, ARRAY(SELECT jsonb_array_elements($2::jsonb)), 0)",
    )
    .bind(queue_name)
    .bind(&wrapped)
    .fetch_all(executor)
    .await?;
    debug!(queue = %queue_name, count = msg_ids.len(), "Batch enqueued");
    Ok(msg_ids)
}

async fn delete_on<'e, E>(executor: E, queue_name: &str, msg_id: i64) -> Result<bool, PgmqError>
where
    E: PgExecutor<'e>,
{
    validate_queue_name(queue_name)?;
    let deleted: bool = sqlx::query_scalar("SELECT pgmq.delete($1, $2::bigint)")
        .bind(queue_name)
        .bind(msg_id)
        .fetch_one(executor)
        .await?;
    Ok(deleted)
}

async fn archive_on<'e, E>(executor: E, queue_name: &str, msg_id: i64) -> Result<bool, PgmqError>
where
    E: PgExecutor<'e>,
{
    validate_queue_name(queue_name)?;
    let archived: bool = sqlx::query_scalar("SELECT pgmq.archive($1, $2::bigint)")
        .bind(queue_name)
        .bind(msg_id)
        .fetch_one(executor)
        .await?;
    Ok(archived)
}

async fn set_visibility_on<'e, E>(
    executor: E,
    queue_name: &str,
    msg_id: i64,
    seconds: i32,
) -> Result<bool, PgmqError>
where
    E: PgExecutor<'e>,
{
    validate_queue_name(queue_name)?;
    // set_vt returns the updated row; absence means the message is gone.
    let updated: Option<i64> =
        sqlx::query_scalar("SELECT msg_id FROM pgmq.set_vt($1, $2::bigint, $3)")
            .bind(queue_name)
            .bind(msg_id)
            .bind(seconds)
            .fetch_optional(executor)
            .await?;
    Ok(updated.is_some())
}

async fn notify_on<'e, E>(executor: E, queue_name: &str) -> Result<(), PgmqError>
where
    E: PgExecutor<'e>,
{
    validate_queue_name(queue_name)?;
    sqlx::query("SELECT pg_notify($1, $1)")
        .bind(queue_name)
        .execute(executor)
        .await?;
    Ok(())
}

async fn archived_message_on<'e, E>(
    executor: E,
    queue_name: &str,
    msg_id: i64,
) -> Result<Option<ArchivedMessage>, PgmqError>
where
    E: PgExecutor<'e>,
{
    validate_queue_name(queue_name)?;
    // Archive tables are per-queue; the name was validated above so the
    // interpolation is identifier-safe.
    let sql = format!(
        "SELECT msg_id, read_ct, enqueued_at, archived_at, message \
         FROM pgmq.a_{queue_name} WHERE msg_id = $1",
    );
    let message = sqlx::query_as::<_, ArchivedMessage>(&sql)
        .bind(msg_id)
        .fetch_optional(executor)
        .await?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_queue_names() {
        assert!(validate_queue_name("payments__commands").is_ok());
        assert!(validate_queue_name("a").is_ok());
        assert!(validate_queue_name("orders__replies_2").is_ok());
    }

    #[test]
    fn test_empty_queue_name_rejected() {
        assert!(matches!(
            validate_queue_name(""),
            Err(PgmqError::InvalidQueueName(_))
        ));
    }

    #[test]
    fn test_queue_name_length_limit() {
        let at_limit = "q".repeat(47);
        assert!(validate_queue_name(&at_limit).is_ok());

        let over_limit = "q".repeat(48);
        assert!(matches!(
            validate_queue_name(&over_limit),
            Err(PgmqError::InvalidQueueName(_))
        ));
    }

    #[test]
    fn test_queue_name_rejects_sql_metacharacters() {
        for bad in ["pay ments", "q;drop", "q\"x", "q'x", "a-b", "q.x"] {
            assert!(
                matches!(validate_queue_name(bad), Err(PgmqError::InvalidQueueName(_))),
                "expected rejection for {bad:?}"
            );
        }
    }
}
