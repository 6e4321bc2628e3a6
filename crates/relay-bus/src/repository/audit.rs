//! # Audit Logger
//!
//! Append-only lifecycle log. Events for one (domain, command_id) are
//! totally ordered by audit_id and are never mutated or deleted for active
//! commands.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::FromRow;
use uuid::Uuid;

use relay_shared::models::{AuditEvent, AuditEventType};
use relay_shared::RelayResult;

#[derive(Debug, FromRow)]
struct AuditRow {
    audit_id: i64,
    domain: String,
    command_id: Uuid,
    event_type: String,
    occurred_at: DateTime<Utc>,
    details: Option<Value>,
}

/// One event to append; used for both single and batched writes.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub domain: String,
    pub command_id: Uuid,
    pub event_type: AuditEventType,
    pub details: Option<Value>,
}

impl AuditEntry {
    pub fn new(
        domain: impl Into<String>,
        command_id: Uuid,
        event_type: AuditEventType,
        details: Option<Value>,
    ) -> Self {
        Self {
            domain: domain.into(),
            command_id,
            event_type,
            details,
        }
    }
}

/// Append-only audit trail writer/reader.
#[derive(Debug, Clone)]
pub struct AuditLogger {
    pool: PgPool,
}

impl AuditLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log(
        &self,
        domain: &str,
        command_id: Uuid,
        event_type: AuditEventType,
        details: Option<&Value>,
    ) -> RelayResult<()> {
        let mut conn = self.pool.acquire().await?;
        self.log_in(&mut conn, domain, command_id, event_type, details)
            .await
    }

    pub async fn log_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        command_id: Uuid,
        event_type: AuditEventType,
        details: Option<&Value>,
    ) -> RelayResult<()> {
        sqlx::query(
            "INSERT INTO bus_audit (domain, command_id, event_type, details) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(domain)
        .bind(command_id)
        .bind(event_type.as_str())
        .bind(details)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Append a chunk of events in a single multi-row insert.
    pub async fn log_batch_in(
        &self,
        conn: &mut PgConnection,
        entries: &[AuditEntry],
    ) -> RelayResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut domains = Vec::with_capacity(entries.len());
        let mut command_ids = Vec::with_capacity(entries.len());
        let mut event_types = Vec::with_capacity(entries.len());
        let mut details: Vec<Option<String>> = Vec::with_capacity(entries.len());

        for entry in entries {
            domains.push(entry.domain.clone());
            command_ids.push(entry.command_id);
            event_types.push(entry.event_type.as_str().to_string());
            details.push(
                entry
                    .details
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            );
        }

        sqlx::query(
            "INSERT INTO bus_audit (domain, command_id, event_type, details) \
             SELECT d, cid, et, dt::jsonb \
             FROM UNNEST($1::text[], $2::uuid[], $3::text[], $4::text[]) AS t(d, cid, et, dt)",
        )
        .bind(&domains)
        .bind(&command_ids)
        .bind(&event_types)
        .bind(&details)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// The audit trail for a command in chronological (audit_id) order.
    pub async fn get_events(
        &self,
        command_id: Uuid,
        domain: Option<&str>,
    ) -> RelayResult<Vec<AuditEvent>> {
        let rows = match domain {
            Some(domain) => {
                sqlx::query_as::<_, AuditRow>(
                    "SELECT audit_id, domain, command_id, event_type, occurred_at, details \
                     FROM bus_audit WHERE command_id = $1 AND domain = $2 \
                     ORDER BY audit_id ASC",
                )
                .bind(command_id)
                .bind(domain)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, AuditRow>(
                    "SELECT audit_id, domain, command_id, event_type, occurred_at, details \
                     FROM bus_audit WHERE command_id = $1 \
                     ORDER BY audit_id ASC",
                )
                .bind(command_id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter()
            .map(|row| {
                Ok(AuditEvent {
                    audit_id: row.audit_id,
                    domain: row.domain,
                    command_id: row.command_id,
                    event_type: AuditEventType::from_str(&row.event_type)?,
                    occurred_at: row.occurred_at,
                    details: row.details,
                })
            })
            .collect()
    }
}
