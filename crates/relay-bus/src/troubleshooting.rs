//! # Troubleshooting Queue
//!
//! Operator surface for commands that exited the normal pipeline
//! (permanent failure or retry exhaustion). Listings join command
//! metadata with the queue archive so operators see the original payload;
//! the three exit paths are retry (back to PENDING with a fresh message),
//! cancel and manual complete.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::postgres::PgConnection;
use sqlx::FromRow;
use tracing::info;
use uuid::Uuid;

use relay_pgmq::PgmqClient;
use relay_shared::models::{
    AuditEventType, CommandError, CommandStatus, ErrorKind, ReplyEnvelope,
};
use relay_shared::{queues, RelayError, RelayResult};

use crate::bus::CommandBus;
use crate::repository::{AuditLogger, BatchRepository, CommandRepository};

/// Filters for troubleshooting listings.
#[derive(Debug, Clone, Default)]
pub struct TroubleshootingFilter {
    pub command_type: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl TroubleshootingFilter {
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }
}

/// A troubleshooting entry: command metadata plus the archived payload.
#[derive(Debug, Clone)]
pub struct TroubleshootingItem {
    pub domain: String,
    pub command_id: Uuid,
    pub command_type: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<CommandError>,
    pub correlation_id: Option<Uuid>,
    pub reply_to: Option<String>,
    /// Original queue payload from the archive; None if the archive row
    /// is gone.
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub batch_id: Option<Uuid>,
}

#[derive(Debug, FromRow)]
struct TroubleshootingRow {
    domain: String,
    command_id: Uuid,
    command_type: String,
    attempts: i32,
    max_attempts: i32,
    last_error_type: Option<String>,
    last_error_code: Option<String>,
    last_error_msg: Option<String>,
    correlation_id: Option<Uuid>,
    reply_queue: Option<String>,
    message: Option<Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    batch_id: Option<Uuid>,
}

impl TryFrom<TroubleshootingRow> for TroubleshootingItem {
    type Error = RelayError;

    fn try_from(row: TroubleshootingRow) -> Result<Self, Self::Error> {
        let last_error = match row.last_error_type {
            Some(kind) => Some(CommandError {
                kind: ErrorKind::from_str(&kind)?,
                code: row.last_error_code.unwrap_or_default(),
                message: row.last_error_msg.unwrap_or_default(),
            }),
            None => None,
        };

        Ok(TroubleshootingItem {
            domain: row.domain,
            command_id: row.command_id,
            command_type: row.command_type,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            last_error,
            correlation_id: row.correlation_id,
            reply_to: row.reply_queue.filter(|q| !q.is_empty()),
            payload: row.message,
            created_at: row.created_at,
            updated_at: row.updated_at,
            batch_id: row.batch_id,
        })
    }
}

/// Validate the domain before its archive table name is interpolated into
/// SQL (queue names are restricted to the same character set).
fn archive_table(domain: &str) -> RelayResult<String> {
    let valid = !domain.is_empty()
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(RelayError::invalid_operation(format!(
            "invalid domain name '{domain}'"
        )));
    }
    Ok(format!("pgmq.a_{domain}__commands"))
}

/// Operator operations over commands in IN_TROUBLESHOOTING_QUEUE.
#[derive(Debug, Clone)]
pub struct TroubleshootingQueue {
    bus: CommandBus,
    pgmq: PgmqClient,
    commands: CommandRepository,
    audit: AuditLogger,
    batches: BatchRepository,
}

impl TroubleshootingQueue {
    pub fn new(bus: CommandBus) -> Self {
        Self {
            pgmq: bus.queue().clone(),
            commands: bus.commands().clone(),
            audit: bus.audit().clone(),
            batches: bus.batches().clone(),
            bus,
        }
    }

    /// List troubleshooting entries for a domain, most recently moved
    /// first, with the archived payload joined in.
    pub async fn list(
        &self,
        domain: &str,
        filter: &TroubleshootingFilter,
    ) -> RelayResult<Vec<TroubleshootingItem>> {
        let archive = archive_table(domain)?;
        let type_clause = if filter.command_type.is_some() {
            " AND c.command_type = $2"
        } else {
            ""
        };
        let sql = format!(
            "SELECT c.domain, c.command_id, c.command_type, c.attempts, c.max_attempts, \
                    c.last_error_type, c.last_error_code, c.last_error_msg, \
                    c.correlation_id, c.reply_queue, a.message, \
                    c.created_at, c.updated_at, c.batch_id \
             FROM bus_command c \
             LEFT JOIN {archive} a ON a.msg_id = c.msg_id \
             WHERE c.domain = $1 AND c.status = 'IN_TROUBLESHOOTING_QUEUE'{type_clause} \
             ORDER BY c.updated_at DESC \
             LIMIT {limit} OFFSET {offset}",
            limit = filter.limit.max(0),
            offset = filter.offset.max(0),
        );

        let mut query = sqlx::query_as::<_, TroubleshootingRow>(&sql).bind(domain);
        if let Some(command_type) = &filter.command_type {
            query = query.bind(command_type.clone());
        }
        let rows = query.fetch_all(self.bus.pool()).await?;
        rows.into_iter().map(TroubleshootingItem::try_from).collect()
    }

    /// Count troubleshooting entries, mirroring the listing filters.
    pub async fn count(&self, domain: &str, command_type: Option<&str>) -> RelayResult<i64> {
        let count: i64 = match command_type {
            Some(command_type) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM bus_command \
                     WHERE domain = $1 AND status = 'IN_TROUBLESHOOTING_QUEUE' \
                       AND command_type = $2",
                )
                .bind(domain)
                .bind(command_type)
                .fetch_one(self.bus.pool())
                .await?
            }
            None => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM bus_command \
                     WHERE domain = $1 AND status = 'IN_TROUBLESHOOTING_QUEUE'",
                )
                .bind(domain)
                .fetch_one(self.bus.pool())
                .await?
            }
        };
        Ok(count)
    }

    /// Re-enqueue a troubleshooting command: fresh message from the
    /// archived payload, attempts reset to zero, last error cleared.
    /// Returns the new msg_id.
    pub async fn retry(
        &self,
        domain: &str,
        command_id: Uuid,
        operator: Option<&str>,
    ) -> RelayResult<i64> {
        let queue_name = queues::command_queue(domain);
        let mut tx = self.bus.pool().begin().await?;

        let metadata = self
            .require_in_tsq(&mut tx, domain, command_id)
            .await?;

        let msg_id = metadata.msg_id.ok_or_else(|| {
            RelayError::invalid_operation(format!(
                "command {command_id} has no queue message to retry"
            ))
        })?;
        let archived = self
            .pgmq
            .archived_message_in(&mut tx, &queue_name, msg_id)
            .await?
            .ok_or_else(|| {
                RelayError::invalid_operation(format!(
                    "archived payload for command {command_id} (msg_id {msg_id}) not found"
                ))
            })?;

        let new_msg_id = self
            .pgmq
            .send_in(&mut tx, &queue_name, &archived.message)
            .await?;

        self.commands
            .reset_for_retry_in(&mut tx, domain, command_id, new_msg_id)
            .await?;

        if let Some(batch_id) = metadata.batch_id {
            self.batches
                .update_on_tsq_retry_in(&mut tx, domain, batch_id)
                .await?;
        }

        self.audit
            .log_in(
                &mut tx,
                domain,
                command_id,
                AuditEventType::OperatorRetry,
                Some(&json!({"operator": operator, "new_msg_id": new_msg_id})),
            )
            .await?;

        self.pgmq.notify_in(&mut tx, &queue_name).await?;
        tx.commit().await?;

        info!(
            domain = %domain,
            command_id = %command_id,
            new_msg_id,
            operator = operator.unwrap_or("unknown"),
            "Operator retried troubleshooting command"
        );
        Ok(new_msg_id)
    }

    /// Cancel a troubleshooting command: terminal CANCELED, reply emitted
    /// when the command carries a reply queue.
    pub async fn cancel(
        &self,
        domain: &str,
        command_id: Uuid,
        reason: &str,
        operator: Option<&str>,
    ) -> RelayResult<()> {
        let mut tx = self.bus.pool().begin().await?;

        let metadata = self
            .require_in_tsq(&mut tx, domain, command_id)
            .await?;

        self.commands
            .sp_finish_command_in(
                &mut tx,
                domain,
                command_id,
                CommandStatus::Canceled,
                AuditEventType::OperatorCancel,
                None,
                Some(&json!({"operator": operator, "reason": reason})),
                None,
            )
            .await?;

        if let Some(reply_to) = &metadata.reply_to {
            let reply = ReplyEnvelope::canceled(command_id, metadata.correlation_id, reason);
            self.pgmq
                .send_in(&mut tx, reply_to, &reply.to_value()?)
                .await?;
            self.pgmq.notify_in(&mut tx, reply_to).await?;
        }

        if let Some(batch_id) = metadata.batch_id {
            let batch_terminal = self
                .batches
                .update_on_tsq_cancel_in(&mut tx, domain, batch_id)
                .await?;
            if batch_terminal {
                self.bus
                    .fire_batch_completion_in(&mut tx, domain, batch_id)
                    .await?;
            }
        }

        tx.commit().await?;

        info!(
            domain = %domain,
            command_id = %command_id,
            operator = operator.unwrap_or("unknown"),
            "Operator canceled troubleshooting command"
        );
        Ok(())
    }

    /// Manually complete a troubleshooting command: terminal COMPLETED
    /// with an operator-supplied result, reply emitted when configured.
    pub async fn complete(
        &self,
        domain: &str,
        command_id: Uuid,
        result_data: Option<Value>,
        operator: Option<&str>,
    ) -> RelayResult<()> {
        let mut tx = self.bus.pool().begin().await?;

        let metadata = self
            .require_in_tsq(&mut tx, domain, command_id)
            .await?;

        self.commands
            .sp_finish_command_in(
                &mut tx,
                domain,
                command_id,
                CommandStatus::Completed,
                AuditEventType::OperatorComplete,
                None,
                Some(&json!({"operator": operator, "result": result_data})),
                None,
            )
            .await?;

        if let Some(reply_to) = &metadata.reply_to {
            let reply =
                ReplyEnvelope::success(command_id, metadata.correlation_id, result_data.clone());
            self.pgmq
                .send_in(&mut tx, reply_to, &reply.to_value()?)
                .await?;
            self.pgmq.notify_in(&mut tx, reply_to).await?;
        }

        if let Some(batch_id) = metadata.batch_id {
            let batch_terminal = self
                .batches
                .update_on_tsq_complete_in(&mut tx, domain, batch_id)
                .await?;
            if batch_terminal {
                self.bus
                    .fire_batch_completion_in(&mut tx, domain, batch_id)
                    .await?;
            }
        }

        tx.commit().await?;

        info!(
            domain = %domain,
            command_id = %command_id,
            operator = operator.unwrap_or("unknown"),
            "Operator completed troubleshooting command"
        );
        Ok(())
    }

    /// Fetch + row-lock the command, enforcing the TSQ precondition.
    async fn require_in_tsq(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        command_id: Uuid,
    ) -> RelayResult<relay_shared::models::CommandMetadata> {
        let metadata = self
            .commands
            .get_for_update_in(conn, domain, command_id)
            .await?
            .ok_or_else(|| RelayError::command_not_found(domain, command_id))?;

        if metadata.status != CommandStatus::InTroubleshootingQueue {
            return Err(RelayError::invalid_operation(format!(
                "command {command_id} is {}, expected IN_TROUBLESHOOTING_QUEUE",
                metadata.status
            )));
        }
        Ok(metadata)
    }
}
