//! # Command Repository
//!
//! Persistence for [`CommandMetadata`] rows, including the fused
//! stored-procedure transitions the worker drives on every message:
//! `sp_receive_command`, `sp_finish_command` and `sp_fail_command`.

use std::collections::HashSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::{FromRow, QueryBuilder};
use tracing::debug;
use uuid::Uuid;

use relay_shared::models::{
    AuditEventType, CommandError, CommandMetadata, CommandQuery, CommandStatus, ErrorKind,
};
use relay_shared::{RelayError, RelayResult};

const SELECT_COLUMNS: &str = "domain, command_id, command_type, status, attempts, max_attempts, \
     msg_id, correlation_id, reply_queue, last_error_type, last_error_code, last_error_msg, \
     created_at, updated_at, batch_id";

/// Raw row shape shared by table reads and `sp_receive_command`.
#[derive(Debug, FromRow)]
struct CommandRow {
    domain: String,
    command_id: Uuid,
    command_type: String,
    status: String,
    attempts: i32,
    max_attempts: i32,
    msg_id: Option<i64>,
    correlation_id: Option<Uuid>,
    reply_queue: Option<String>,
    last_error_type: Option<String>,
    last_error_code: Option<String>,
    last_error_msg: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    batch_id: Option<Uuid>,
}

impl TryFrom<CommandRow> for CommandMetadata {
    type Error = RelayError;

    fn try_from(row: CommandRow) -> Result<Self, Self::Error> {
        let last_error = match row.last_error_type {
            Some(kind) => Some(CommandError {
                kind: ErrorKind::from_str(&kind)?,
                code: row.last_error_code.unwrap_or_default(),
                message: row.last_error_msg.unwrap_or_default(),
            }),
            None => None,
        };

        Ok(CommandMetadata {
            domain: row.domain,
            command_id: row.command_id,
            command_type: row.command_type,
            status: CommandStatus::from_str(&row.status)?,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            msg_id: row.msg_id,
            correlation_id: row.correlation_id,
            reply_to: row.reply_queue.filter(|q| !q.is_empty()),
            last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            batch_id: row.batch_id,
        })
    }
}

/// Repository for command metadata rows.
#[derive(Debug, Clone)]
pub struct CommandRepository {
    pool: PgPool,
}

impl CommandRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // -------------------------------------------------------------------
    // Existence (idempotency checks)
    // -------------------------------------------------------------------

    pub async fn exists(&self, domain: &str, command_id: Uuid) -> RelayResult<bool> {
        let mut conn = self.pool.acquire().await?;
        self.exists_in(&mut conn, domain, command_id).await
    }

    pub async fn exists_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        command_id: Uuid,
    ) -> RelayResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM bus_command WHERE domain = $1 AND command_id = $2)",
        )
        .bind(domain)
        .bind(command_id)
        .fetch_one(conn)
        .await?;
        Ok(exists)
    }

    /// Which of the given command ids already exist in the domain.
    pub async fn exists_batch_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        command_ids: &[Uuid],
    ) -> RelayResult<HashSet<Uuid>> {
        if command_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let existing: Vec<Uuid> = sqlx::query_scalar(
            "SELECT command_id FROM bus_command \
             WHERE domain = $1 AND command_id = ANY($2)",
        )
        .bind(domain)
        .bind(command_ids)
        .fetch_all(conn)
        .await?;
        Ok(existing.into_iter().collect())
    }

    // -------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------

    pub async fn save_in(
        &self,
        conn: &mut PgConnection,
        metadata: &CommandMetadata,
        queue_name: &str,
    ) -> RelayResult<()> {
        sqlx::query(
            "INSERT INTO bus_command (\
                domain, command_id, queue_name, msg_id, command_type, status, \
                attempts, max_attempts, correlation_id, reply_queue, \
                created_at, updated_at, batch_id\
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(&metadata.domain)
        .bind(metadata.command_id)
        .bind(queue_name)
        .bind(metadata.msg_id)
        .bind(&metadata.command_type)
        .bind(metadata.status.as_str())
        .bind(metadata.attempts)
        .bind(metadata.max_attempts)
        .bind(metadata.correlation_id)
        .bind(&metadata.reply_to)
        .bind(metadata.created_at)
        .bind(metadata.updated_at)
        .bind(metadata.batch_id)
        .execute(conn)
        .await?;
        debug!(domain = %metadata.domain, command_id = %metadata.command_id, "Saved command metadata");
        Ok(())
    }

    /// Insert a chunk of PENDING rows in a single statement.
    pub async fn save_batch_in(
        &self,
        conn: &mut PgConnection,
        metadata_list: &[CommandMetadata],
        queue_name: &str,
    ) -> RelayResult<()> {
        if metadata_list.is_empty() {
            return Ok(());
        }

        let mut domains = Vec::with_capacity(metadata_list.len());
        let mut command_ids = Vec::with_capacity(metadata_list.len());
        let mut msg_ids = Vec::with_capacity(metadata_list.len());
        let mut command_types = Vec::with_capacity(metadata_list.len());
        let mut max_attempts = Vec::with_capacity(metadata_list.len());
        let mut correlation_ids = Vec::with_capacity(metadata_list.len());
        let mut reply_queues = Vec::with_capacity(metadata_list.len());
        let mut created_ats = Vec::with_capacity(metadata_list.len());
        let mut updated_ats = Vec::with_capacity(metadata_list.len());
        let mut batch_ids = Vec::with_capacity(metadata_list.len());

        for metadata in metadata_list {
            domains.push(metadata.domain.clone());
            command_ids.push(metadata.command_id);
            msg_ids.push(metadata.msg_id);
            command_types.push(metadata.command_type.clone());
            max_attempts.push(metadata.max_attempts);
            correlation_ids.push(metadata.correlation_id);
            reply_queues.push(metadata.reply_to.clone());
            created_ats.push(metadata.created_at);
            updated_ats.push(metadata.updated_at);
            batch_ids.push(metadata.batch_id);
        }

        sqlx::query(
            "INSERT INTO bus_command (\
                domain, command_id, queue_name, msg_id, command_type, status, \
                attempts, max_attempts, correlation_id, reply_queue, \
                created_at, updated_at, batch_id\
             ) \
             SELECT d, cid, $11, mid, ct, 'PENDING', 0, ma, corr, rq, ca, ua, bid \
             FROM UNNEST(\
                $1::text[], $2::uuid[], $3::bigint[], $4::text[], $5::int[], \
                $6::uuid[], $7::text[], $8::timestamptz[], $9::timestamptz[], $10::uuid[]\
             ) AS t(d, cid, mid, ct, ma, corr, rq, ca, ua, bid)",
        )
        .bind(&domains)
        .bind(&command_ids)
        .bind(&msg_ids)
        .bind(&command_types)
        .bind(&max_attempts)
        .bind(&correlation_ids)
        .bind(&reply_queues)
        .bind(&created_ats)
        .bind(&updated_ats)
        .bind(&batch_ids)
        .bind(queue_name)
        .execute(conn)
        .await?;
        debug!(count = metadata_list.len(), queue = %queue_name, "Saved command metadata batch");
        Ok(())
    }

    // -------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------

    pub async fn get(&self, domain: &str, command_id: Uuid) -> RelayResult<Option<CommandMetadata>> {
        let mut conn = self.pool.acquire().await?;
        self.get_in(&mut conn, domain, command_id).await
    }

    pub async fn get_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        command_id: Uuid,
    ) -> RelayResult<Option<CommandMetadata>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM bus_command WHERE domain = $1 AND command_id = $2"
        );
        let row = sqlx::query_as::<_, CommandRow>(&sql)
            .bind(domain)
            .bind(command_id)
            .fetch_optional(conn)
            .await?;
        row.map(CommandMetadata::try_from).transpose()
    }

    /// Fetch and row-lock a command for an operator transition.
    pub async fn get_for_update_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        command_id: Uuid,
    ) -> RelayResult<Option<CommandMetadata>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM bus_command \
             WHERE domain = $1 AND command_id = $2 FOR UPDATE"
        );
        let row = sqlx::query_as::<_, CommandRow>(&sql)
            .bind(domain)
            .bind(command_id)
            .fetch_optional(conn)
            .await?;
        row.map(CommandMetadata::try_from).transpose()
    }

    /// Query commands by filters, newest first.
    pub async fn query(&self, filter: &CommandQuery) -> RelayResult<Vec<CommandMetadata>> {
        let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!(
            "SELECT {SELECT_COLUMNS} FROM bus_command WHERE TRUE"
        ));

        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(domain) = &filter.domain {
            qb.push(" AND domain = ").push_bind(domain.clone());
        }
        if let Some(command_type) = &filter.command_type {
            qb.push(" AND command_type = ").push_bind(command_type.clone());
        }
        if let Some(created_after) = filter.created_after {
            qb.push(" AND created_at >= ").push_bind(created_after);
        }
        if let Some(created_before) = filter.created_before {
            qb.push(" AND created_at <= ").push_bind(created_before);
        }

        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(filter.limit)
            .push(" OFFSET ")
            .push_bind(filter.offset);

        let rows = qb
            .build_query_as::<CommandRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(CommandMetadata::try_from).collect()
    }

    // -------------------------------------------------------------------
    // Primitive transitions (non-fused paths)
    // -------------------------------------------------------------------

    pub async fn update_status_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        command_id: Uuid,
        status: CommandStatus,
    ) -> RelayResult<bool> {
        let result = sqlx::query(
            "UPDATE bus_command SET status = $1, updated_at = now() \
             WHERE domain = $2 AND command_id = $3",
        )
        .bind(status.as_str())
        .bind(domain)
        .bind(command_id)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_msg_id_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        command_id: Uuid,
        msg_id: i64,
    ) -> RelayResult<bool> {
        let result = sqlx::query(
            "UPDATE bus_command SET msg_id = $1, updated_at = now() \
             WHERE domain = $2 AND command_id = $3",
        )
        .bind(msg_id)
        .bind(domain)
        .bind(command_id)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_error_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        command_id: Uuid,
        error: &CommandError,
    ) -> RelayResult<bool> {
        let result = sqlx::query(
            "UPDATE bus_command \
             SET last_error_type = $1, last_error_code = $2, last_error_msg = $3, \
                 updated_at = now() \
             WHERE domain = $4 AND command_id = $5",
        )
        .bind(error.kind.as_str())
        .bind(&error.code)
        .bind(&error.message)
        .bind(domain)
        .bind(command_id)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn increment_attempts_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        command_id: Uuid,
    ) -> RelayResult<Option<i32>> {
        let attempts: Option<i32> = sqlx::query_scalar(
            "UPDATE bus_command SET attempts = attempts + 1, updated_at = now() \
             WHERE domain = $1 AND command_id = $2 \
             RETURNING attempts",
        )
        .bind(domain)
        .bind(command_id)
        .fetch_optional(conn)
        .await?;
        Ok(attempts)
    }

    /// Non-fused terminal write; the fused path is
    /// [`CommandRepository::sp_finish_command`].
    pub async fn finish_command_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        command_id: Uuid,
        status: CommandStatus,
        error: Option<&CommandError>,
    ) -> RelayResult<bool> {
        let result = sqlx::query(
            "UPDATE bus_command \
             SET status = $1, \
                 last_error_type = COALESCE($2, last_error_type), \
                 last_error_code = COALESCE($3, last_error_code), \
                 last_error_msg = COALESCE($4, last_error_msg), \
                 updated_at = now() \
             WHERE domain = $5 AND command_id = $6",
        )
        .bind(status.as_str())
        .bind(error.map(|e| e.kind.as_str()))
        .bind(error.map(|e| e.code.as_str()))
        .bind(error.map(|e| e.message.as_str()))
        .bind(domain)
        .bind(command_id)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Operator retry reset: back to PENDING with a fresh message id, a
    /// zeroed attempts counter and no last error.
    pub async fn reset_for_retry_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        command_id: Uuid,
        new_msg_id: i64,
    ) -> RelayResult<bool> {
        let result = sqlx::query(
            "UPDATE bus_command \
             SET status = 'PENDING', attempts = 0, msg_id = $1, \
                 last_error_type = NULL, last_error_code = NULL, last_error_msg = NULL, \
                 updated_at = now() \
             WHERE domain = $2 AND command_id = $3",
        )
        .bind(new_msg_id)
        .bind(domain)
        .bind(command_id)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // -------------------------------------------------------------------
    // Fused stored-procedure transitions
    // -------------------------------------------------------------------

    /// Atomically transition to IN_PROGRESS and return the updated
    /// metadata. Returns None when the command is terminal (or unknown):
    /// the caller archives the queue message so redelivery of a completed
    /// command never regresses state.
    pub async fn sp_receive_command_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        command_id: Uuid,
        msg_id: Option<i64>,
        max_attempts: Option<i32>,
    ) -> RelayResult<Option<CommandMetadata>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM sp_receive_command($1, $2, $3, $4, $5)"
        );
        let row = sqlx::query_as::<_, CommandRow>(&sql)
            .bind(domain)
            .bind(command_id)
            .bind(CommandStatus::InProgress.as_str())
            .bind(msg_id)
            .bind(max_attempts)
            .fetch_optional(conn)
            .await?;
        row.map(CommandMetadata::try_from).transpose()
    }

    /// Write a terminal status, the audit event and the batch counters in
    /// one round-trip. Returns true iff the batch became terminal.
    #[allow(clippy::too_many_arguments)]
    pub async fn sp_finish_command_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        command_id: Uuid,
        status: CommandStatus,
        audit_event: AuditEventType,
        error: Option<&CommandError>,
        details: Option<&Value>,
        batch_id: Option<Uuid>,
    ) -> RelayResult<bool> {
        let batch_terminal: bool = sqlx::query_scalar(
            "SELECT sp_finish_command($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(domain)
        .bind(command_id)
        .bind(status.as_str())
        .bind(audit_event.as_str())
        .bind(error.map(|e| e.kind.as_str()))
        .bind(error.map(|e| e.code.as_str()))
        .bind(error.map(|e| e.message.as_str()))
        .bind(details)
        .bind(batch_id)
        .fetch_one(conn)
        .await?;
        Ok(batch_terminal)
    }

    /// Stamp a transient failure without leaving IN_PROGRESS; the worker
    /// then defers the queue message's visibility for backoff.
    #[allow(clippy::too_many_arguments)]
    pub async fn sp_fail_command_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        command_id: Uuid,
        error: &CommandError,
        attempts: i32,
        max_attempts: Option<i32>,
        msg_id: Option<i64>,
    ) -> RelayResult<bool> {
        let updated: bool = sqlx::query_scalar(
            "SELECT sp_fail_command($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(domain)
        .bind(command_id)
        .bind(error.kind.as_str())
        .bind(&error.code)
        .bind(&error.message)
        .bind(attempts)
        .bind(max_attempts)
        .bind(msg_id)
        .fetch_one(conn)
        .await?;
        Ok(updated)
    }
}
