//! # Process Repository
//!
//! Persistence for process-manager state and the append-only step trail.
//! A process row is only ever mutated inside transactions that also write
//! the corresponding command or consume a reply.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::FromRow;
use uuid::Uuid;

use relay_shared::models::{
    CommandError, ErrorKind, ProcessMetadata, ProcessStatus, ProcessStepRecord, ReplyOutcome,
};
use relay_shared::{RelayError, RelayResult};

const SELECT_COLUMNS: &str = "domain, process_id, process_type, status, current_step, state, \
     last_error_type, last_error_code, last_error_msg, \
     created_at, updated_at, completed_at, batch_id";

#[derive(Debug, FromRow)]
struct ProcessRow {
    domain: String,
    process_id: Uuid,
    process_type: String,
    status: String,
    current_step: Option<String>,
    state: Value,
    last_error_type: Option<String>,
    last_error_code: Option<String>,
    last_error_msg: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    batch_id: Option<Uuid>,
}

impl TryFrom<ProcessRow> for ProcessMetadata {
    type Error = RelayError;

    fn try_from(row: ProcessRow) -> Result<Self, Self::Error> {
        let last_error = match row.last_error_type {
            Some(kind) => Some(CommandError {
                kind: ErrorKind::from_str(&kind)?,
                code: row.last_error_code.unwrap_or_default(),
                message: row.last_error_msg.unwrap_or_default(),
            }),
            None => None,
        };

        Ok(ProcessMetadata {
            domain: row.domain,
            process_id: row.process_id,
            process_type: row.process_type,
            status: ProcessStatus::from_str(&row.status)?,
            current_step: row.current_step,
            state: row.state,
            last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
            batch_id: row.batch_id,
        })
    }
}

#[derive(Debug, FromRow)]
struct StepRow {
    step_id: i64,
    domain: String,
    process_id: Uuid,
    step_name: String,
    command_id: Uuid,
    command_type: String,
    command_data: Option<Value>,
    sent_at: DateTime<Utc>,
    reply_outcome: Option<String>,
    reply_data: Option<Value>,
    received_at: Option<DateTime<Utc>>,
}

impl TryFrom<StepRow> for ProcessStepRecord {
    type Error = RelayError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        Ok(ProcessStepRecord {
            step_id: row.step_id,
            domain: row.domain,
            process_id: row.process_id,
            step_name: row.step_name,
            command_id: row.command_id,
            command_type: row.command_type,
            command_data: row.command_data,
            sent_at: row.sent_at,
            reply_outcome: row
                .reply_outcome
                .map(|o| ReplyOutcome::from_str(&o))
                .transpose()?,
            reply_data: row.reply_data,
            received_at: row.received_at,
        })
    }
}

/// A step-trail entry recorded when a step's command is issued.
#[derive(Debug, Clone)]
pub struct StepInsert {
    pub domain: String,
    pub process_id: Uuid,
    pub step_name: String,
    pub command_id: Uuid,
    pub command_type: String,
    pub command_data: Option<Value>,
}

/// Repository for process rows and their step trails.
#[derive(Debug, Clone)]
pub struct ProcessRepository {
    pool: PgPool,
}

impl ProcessRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn save_in(
        &self,
        conn: &mut PgConnection,
        metadata: &ProcessMetadata,
    ) -> RelayResult<()> {
        sqlx::query(
            "INSERT INTO bus_process (\
                domain, process_id, process_type, status, current_step, state, \
                created_at, updated_at, completed_at, batch_id\
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(&metadata.domain)
        .bind(metadata.process_id)
        .bind(&metadata.process_type)
        .bind(metadata.status.as_str())
        .bind(&metadata.current_step)
        .bind(&metadata.state)
        .bind(metadata.created_at)
        .bind(metadata.updated_at)
        .bind(metadata.completed_at)
        .bind(metadata.batch_id)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn get(&self, domain: &str, process_id: Uuid) -> RelayResult<Option<ProcessMetadata>> {
        let mut conn = self.pool.acquire().await?;
        self.get_in(&mut conn, domain, process_id).await
    }

    pub async fn get_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        process_id: Uuid,
    ) -> RelayResult<Option<ProcessMetadata>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM bus_process WHERE domain = $1 AND process_id = $2"
        );
        let row = sqlx::query_as::<_, ProcessRow>(&sql)
            .bind(domain)
            .bind(process_id)
            .fetch_optional(conn)
            .await?;
        row.map(ProcessMetadata::try_from).transpose()
    }

    /// Fetch and row-lock a process for reply dispatch.
    pub async fn get_for_update_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        process_id: Uuid,
    ) -> RelayResult<Option<ProcessMetadata>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM bus_process \
             WHERE domain = $1 AND process_id = $2 FOR UPDATE"
        );
        let row = sqlx::query_as::<_, ProcessRow>(&sql)
            .bind(domain)
            .bind(process_id)
            .fetch_optional(conn)
            .await?;
        row.map(ProcessMetadata::try_from).transpose()
    }

    /// Advance state and step; used when issuing the next command
    /// (WAITING_FOR_REPLY) or marking progress.
    pub async fn update_state_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        process_id: Uuid,
        status: ProcessStatus,
        current_step: Option<&str>,
        state: &Value,
    ) -> RelayResult<bool> {
        let result = sqlx::query(
            "UPDATE bus_process \
             SET status = $1, current_step = $2, state = $3, updated_at = now() \
             WHERE domain = $4 AND process_id = $5",
        )
        .bind(status.as_str())
        .bind(current_step)
        .bind(state)
        .bind(domain)
        .bind(process_id)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Terminal completion: final state, COMPLETED, completed_at stamped.
    pub async fn complete_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        process_id: Uuid,
        state: &Value,
    ) -> RelayResult<bool> {
        let result = sqlx::query(
            "UPDATE bus_process \
             SET status = 'COMPLETED', current_step = NULL, state = $1, \
                 updated_at = now(), completed_at = now() \
             WHERE domain = $2 AND process_id = $3",
        )
        .bind(state)
        .bind(domain)
        .bind(process_id)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Terminal failure with the error that stopped the process.
    pub async fn fail_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        process_id: Uuid,
        error: &CommandError,
    ) -> RelayResult<bool> {
        let result = sqlx::query(
            "UPDATE bus_process \
             SET status = 'FAILED', \
                 last_error_type = $1, last_error_code = $2, last_error_msg = $3, \
                 updated_at = now(), completed_at = now() \
             WHERE domain = $4 AND process_id = $5",
        )
        .bind(error.kind.as_str())
        .bind(&error.code)
        .bind(&error.message)
        .bind(domain)
        .bind(process_id)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record a step's command issuance in the append-only trail.
    pub async fn record_step_in(
        &self,
        conn: &mut PgConnection,
        step: &StepInsert,
    ) -> RelayResult<i64> {
        let step_id: i64 = sqlx::query_scalar(
            "INSERT INTO bus_process_step (\
                domain, process_id, step_name, command_id, command_type, command_data\
             ) VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING step_id",
        )
        .bind(&step.domain)
        .bind(step.process_id)
        .bind(&step.step_name)
        .bind(step.command_id)
        .bind(&step.command_type)
        .bind(&step.command_data)
        .fetch_one(conn)
        .await?;
        Ok(step_id)
    }

    /// Stamp the reply onto the open step row for the answered command.
    pub async fn record_reply_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        process_id: Uuid,
        command_id: Uuid,
        outcome: ReplyOutcome,
        reply_data: Option<&Value>,
    ) -> RelayResult<bool> {
        let result = sqlx::query(
            "UPDATE bus_process_step \
             SET reply_outcome = $1, reply_data = $2, received_at = now() \
             WHERE domain = $3 AND process_id = $4 AND command_id = $5 \
               AND received_at IS NULL",
        )
        .bind(outcome.as_str())
        .bind(reply_data)
        .bind(domain)
        .bind(process_id)
        .bind(command_id)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// The step trail in issue order.
    pub async fn get_steps(
        &self,
        domain: &str,
        process_id: Uuid,
    ) -> RelayResult<Vec<ProcessStepRecord>> {
        let rows = sqlx::query_as::<_, StepRow>(
            "SELECT step_id, domain, process_id, step_name, command_id, command_type, \
                    command_data, sent_at, reply_outcome, reply_data, received_at \
             FROM bus_process_step \
             WHERE domain = $1 AND process_id = $2 \
             ORDER BY step_id ASC",
        )
        .bind(domain)
        .bind(process_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ProcessStepRecord::try_from).collect()
    }

    /// List processes for a domain, newest first.
    pub async fn list_processes(
        &self,
        domain: &str,
        status: Option<ProcessStatus>,
        limit: i64,
        offset: i64,
    ) -> RelayResult<Vec<ProcessMetadata>> {
        let rows = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM bus_process \
                     WHERE domain = $1 AND status = $2 \
                     ORDER BY created_at DESC LIMIT $3 OFFSET $4"
                );
                sqlx::query_as::<_, ProcessRow>(&sql)
                    .bind(domain)
                    .bind(status.as_str())
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM bus_process WHERE domain = $1 \
                     ORDER BY created_at DESC LIMIT $2 OFFSET $3"
                );
                sqlx::query_as::<_, ProcessRow>(&sql)
                    .bind(domain)
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(ProcessMetadata::try_from).collect()
    }
}
