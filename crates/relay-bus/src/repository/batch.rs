//! # Batch Repository
//!
//! Persistence for batch aggregates. The counters are mutated exclusively
//! through the `sp_update_batch_on_*` stored procedures so that concurrent
//! workers and operator actions serialize on the batch row.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::FromRow;
use tracing::debug;
use uuid::Uuid;

use relay_shared::models::{BatchMetadata, BatchStatus, CompletionCommand};
use relay_shared::{RelayError, RelayResult};

const SELECT_COLUMNS: &str = "domain, batch_id, name, custom_data, status, total_count, \
     completed_count, failed_count, canceled_count, in_troubleshooting_count, \
     completion_command, created_at, started_at, completed_at";

#[derive(Debug, FromRow)]
struct BatchRow {
    domain: String,
    batch_id: Uuid,
    name: Option<String>,
    custom_data: Option<Value>,
    status: String,
    total_count: i32,
    completed_count: i32,
    failed_count: i32,
    canceled_count: i32,
    in_troubleshooting_count: i32,
    completion_command: Option<Value>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<BatchRow> for BatchMetadata {
    type Error = RelayError;

    fn try_from(row: BatchRow) -> Result<Self, Self::Error> {
        let completion_command: Option<CompletionCommand> = row
            .completion_command
            .map(serde_json::from_value)
            .transpose()?;

        Ok(BatchMetadata {
            domain: row.domain,
            batch_id: row.batch_id,
            name: row.name,
            custom_data: row.custom_data,
            status: BatchStatus::from_str(&row.status)?,
            total_count: row.total_count,
            completed_count: row.completed_count,
            failed_count: row.failed_count,
            canceled_count: row.canceled_count,
            in_troubleshooting_count: row.in_troubleshooting_count,
            completion_command,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

/// Repository for batch metadata and the aggregate counter procedures.
#[derive(Debug, Clone)]
pub struct BatchRepository {
    pool: PgPool,
}

impl BatchRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn save_in(
        &self,
        conn: &mut PgConnection,
        metadata: &BatchMetadata,
    ) -> RelayResult<()> {
        let completion_command = metadata
            .completion_command
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        sqlx::query(
            "INSERT INTO bus_batch (\
                domain, batch_id, name, custom_data, status, total_count, \
                completed_count, failed_count, canceled_count, \
                in_troubleshooting_count, completion_command, \
                created_at, started_at, completed_at\
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(&metadata.domain)
        .bind(metadata.batch_id)
        .bind(&metadata.name)
        .bind(&metadata.custom_data)
        .bind(metadata.status.as_str())
        .bind(metadata.total_count)
        .bind(metadata.completed_count)
        .bind(metadata.failed_count)
        .bind(metadata.canceled_count)
        .bind(metadata.in_troubleshooting_count)
        .bind(completion_command)
        .bind(metadata.created_at)
        .bind(metadata.started_at)
        .bind(metadata.completed_at)
        .execute(conn)
        .await?;
        debug!(domain = %metadata.domain, batch_id = %metadata.batch_id, "Saved batch metadata");
        Ok(())
    }

    pub async fn get(&self, domain: &str, batch_id: Uuid) -> RelayResult<Option<BatchMetadata>> {
        let mut conn = self.pool.acquire().await?;
        self.get_in(&mut conn, domain, batch_id).await
    }

    pub async fn get_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        batch_id: Uuid,
    ) -> RelayResult<Option<BatchMetadata>> {
        let sql =
            format!("SELECT {SELECT_COLUMNS} FROM bus_batch WHERE domain = $1 AND batch_id = $2");
        let row = sqlx::query_as::<_, BatchRow>(&sql)
            .bind(domain)
            .bind(batch_id)
            .fetch_optional(conn)
            .await?;
        row.map(BatchMetadata::try_from).transpose()
    }

    pub async fn exists_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        batch_id: Uuid,
    ) -> RelayResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM bus_batch WHERE domain = $1 AND batch_id = $2)",
        )
        .bind(domain)
        .bind(batch_id)
        .fetch_one(conn)
        .await?;
        Ok(exists)
    }

    /// List batches for a domain, newest first.
    pub async fn list_batches(
        &self,
        domain: &str,
        status: Option<BatchStatus>,
        limit: i64,
        offset: i64,
    ) -> RelayResult<Vec<BatchMetadata>> {
        let rows = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM bus_batch \
                     WHERE domain = $1 AND status = $2 \
                     ORDER BY created_at DESC LIMIT $3 OFFSET $4"
                );
                sqlx::query_as::<_, BatchRow>(&sql)
                    .bind(domain)
                    .bind(status.as_str())
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM bus_batch WHERE domain = $1 \
                     ORDER BY created_at DESC LIMIT $2 OFFSET $3"
                );
                sqlx::query_as::<_, BatchRow>(&sql)
                    .bind(domain)
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(BatchMetadata::try_from).collect()
    }

    // -------------------------------------------------------------------
    // Counter procedures
    // -------------------------------------------------------------------

    /// First receive of any contained command: PENDING -> IN_PROGRESS.
    /// Returns true iff this call performed the transition.
    pub async fn update_on_receive_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        batch_id: Uuid,
    ) -> RelayResult<bool> {
        self.call_counter_sp(conn, "sp_update_batch_on_receive", domain, batch_id)
            .await
    }

    /// Worker completion. Returns true iff the batch became terminal.
    pub async fn update_on_complete_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        batch_id: Uuid,
    ) -> RelayResult<bool> {
        self.call_counter_sp(conn, "sp_update_batch_on_complete", domain, batch_id)
            .await
    }

    /// Command moved to the troubleshooting queue.
    pub async fn update_on_tsq_move_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        batch_id: Uuid,
    ) -> RelayResult<bool> {
        self.call_counter_sp(conn, "sp_update_batch_on_tsq_move", domain, batch_id)
            .await
    }

    /// Operator completed from the TSQ. Returns true iff the batch became
    /// terminal.
    pub async fn update_on_tsq_complete_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        batch_id: Uuid,
    ) -> RelayResult<bool> {
        self.call_counter_sp(conn, "sp_update_batch_on_tsq_complete", domain, batch_id)
            .await
    }

    /// Operator canceled from the TSQ. Returns true iff the batch became
    /// terminal.
    pub async fn update_on_tsq_cancel_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        batch_id: Uuid,
    ) -> RelayResult<bool> {
        self.call_counter_sp(conn, "sp_update_batch_on_tsq_cancel", domain, batch_id)
            .await
    }

    /// Operator retried from the TSQ; the command re-enters the pipeline.
    pub async fn update_on_tsq_retry_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        batch_id: Uuid,
    ) -> RelayResult<bool> {
        self.call_counter_sp(conn, "sp_update_batch_on_tsq_retry", domain, batch_id)
            .await
    }

    async fn call_counter_sp(
        &self,
        conn: &mut PgConnection,
        sp_name: &str,
        domain: &str,
        batch_id: Uuid,
    ) -> RelayResult<bool> {
        // sp_name is always one of the six literals above
        let sql = format!("SELECT {sp_name}($1, $2)");
        let result: bool = sqlx::query_scalar(&sql)
            .bind(domain)
            .bind(batch_id)
            .fetch_one(conn)
            .await?;
        if result {
            debug!(domain = %domain, batch_id = %batch_id, sp = %sp_name, "Batch counter transition");
        }
        Ok(result)
    }
}
