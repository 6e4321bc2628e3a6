//! # Command Bus
//!
//! The public submission façade. Every submission path runs as one
//! database transaction covering the duplicate check, the queue enqueue,
//! the metadata save and the SENT audit event, with the queue NOTIFY
//! delivered at commit.
//!
//! Idempotency: the existence check runs inside the same transaction as
//! the insert, and the (domain, command_id) primary key backstops
//! concurrent racers -- the losing transaction surfaces
//! [`RelayError::DuplicateCommand`].

use chrono::Utc;
use serde_json::{json, Value};
use sqlx::postgres::{PgConnection, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use relay_pgmq::PgmqClient;
use relay_shared::models::{
    AuditEvent, AuditEventType, BatchCommand, BatchMetadata, BatchSendResult, BatchStatus,
    CommandEnvelope, CommandMetadata, CommandQuery, CommandStatus, CompletionCommand, SendRequest,
    SendResult,
};
use relay_shared::{queues, RelayError, RelayResult};

use crate::repository::{AuditEntry, AuditLogger, BatchRepository, CommandRepository};

/// Default max commands per transaction in bulk submission.
pub const DEFAULT_BATCH_CHUNK_SIZE: usize = 1_000;

/// Options for [`CommandBus::create_batch`].
#[derive(Debug, Clone, Default)]
pub struct CreateBatchOptions {
    pub name: Option<String>,
    pub custom_data: Option<Value>,
    /// Caller-assigned batch id; generated when absent.
    pub batch_id: Option<Uuid>,
    /// Follow-up command fired, in the terminal transaction, when the
    /// batch completes. Persisted on the batch row so it survives
    /// restarts.
    pub completion_command: Option<CompletionCommand>,
}

/// The command bus: single, bulk and batch submission plus the read
/// surface over commands, audit trails and batches.
#[derive(Debug, Clone)]
pub struct CommandBus {
    pool: PgPool,
    pgmq: PgmqClient,
    commands: CommandRepository,
    audit: AuditLogger,
    batches: BatchRepository,
    default_max_attempts: i32,
    batch_chunk_size: usize,
}

impl CommandBus {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pgmq: PgmqClient::new(pool.clone()),
            commands: CommandRepository::new(pool.clone()),
            audit: AuditLogger::new(pool.clone()),
            batches: BatchRepository::new(pool.clone()),
            pool,
            default_max_attempts: 3,
            batch_chunk_size: DEFAULT_BATCH_CHUNK_SIZE,
        }
    }

    pub fn with_default_max_attempts(mut self, max_attempts: i32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    pub fn with_batch_chunk_size(mut self, chunk_size: usize) -> Self {
        self.batch_chunk_size = chunk_size.max(1);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn queue(&self) -> &PgmqClient {
        &self.pgmq
    }

    pub fn commands(&self) -> &CommandRepository {
        &self.commands
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn batches(&self) -> &BatchRepository {
        &self.batches
    }

    pub fn default_max_attempts(&self) -> i32 {
        self.default_max_attempts
    }

    /// Ensure the command queue (and default reply queue) for a domain
    /// exist. Idempotent.
    pub async fn ensure_domain(&self, domain: &str) -> RelayResult<()> {
        self.pgmq.create_queue(&queues::command_queue(domain)).await?;
        self.pgmq.create_queue(&queues::reply_queue(domain)).await?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------

    /// Send a single command in its own transaction.
    pub async fn send(&self, request: SendRequest) -> RelayResult<SendResult> {
        let mut tx = self.pool.begin().await?;
        let result = self.send_in(&mut tx, &request).await?;
        tx.commit().await?;

        info!(
            domain = %request.domain,
            command_type = %request.command_type,
            command_id = %request.command_id,
            msg_id = result.msg_id,
            "Sent command"
        );
        Ok(result)
    }

    /// Send a command within a caller-owned transaction.
    ///
    /// Used by the bus itself, by process managers issuing step commands,
    /// and by batch-completion firing -- anywhere a submission must be
    /// atomic with other writes.
    pub async fn send_in(
        &self,
        conn: &mut PgConnection,
        request: &SendRequest,
    ) -> RelayResult<SendResult> {
        let queue_name = queues::command_queue(&request.domain);

        if let Some(batch_id) = request.batch_id {
            if !self.batches.exists_in(conn, &request.domain, batch_id).await? {
                return Err(RelayError::batch_not_found(&request.domain, batch_id));
            }
        }

        if self
            .commands
            .exists_in(conn, &request.domain, request.command_id)
            .await?
        {
            return Err(RelayError::duplicate_command(
                &request.domain,
                request.command_id,
            ));
        }

        let correlation_id = request.correlation_id.unwrap_or_else(Uuid::new_v4);
        let envelope = CommandEnvelope {
            domain: request.domain.clone(),
            command_type: request.command_type.clone(),
            command_id: request.command_id,
            correlation_id,
            data: request.data.clone(),
            reply_to: request.reply_to.clone(),
        };

        let msg_id = self
            .pgmq
            .send_in(conn, &queue_name, &envelope.to_value()?)
            .await?;

        let now = Utc::now();
        let metadata = CommandMetadata {
            domain: request.domain.clone(),
            command_id: request.command_id,
            command_type: request.command_type.clone(),
            status: CommandStatus::Pending,
            attempts: 0,
            max_attempts: request.max_attempts.unwrap_or(self.default_max_attempts),
            msg_id: Some(msg_id),
            correlation_id: Some(correlation_id),
            reply_to: request.reply_to.clone(),
            last_error: None,
            created_at: now,
            updated_at: now,
            batch_id: request.batch_id,
        };
        // A concurrent racer can pass the existence check above and lose on
        // the (domain, command_id) primary key instead; surface that the
        // same way as the pre-check.
        self.commands
            .save_in(conn, &metadata, &queue_name)
            .await
            .map_err(|e| map_unique_violation(e, &request.domain, request.command_id))?;

        self.audit
            .log_in(
                conn,
                &request.domain,
                request.command_id,
                AuditEventType::Sent,
                Some(&sent_details(&metadata)),
            )
            .await?;

        self.pgmq.notify_in(conn, &queue_name).await?;

        Ok(SendResult {
            command_id: request.command_id,
            msg_id,
        })
    }

    /// Send many commands in chunked transactions: per chunk one
    /// transaction, one metadata multi-insert, one audit multi-insert and
    /// one NOTIFY per (chunk, domain).
    pub async fn send_batch(
        &self,
        requests: Vec<SendRequest>,
        chunk_size: Option<usize>,
    ) -> RelayResult<BatchSendResult> {
        if requests.is_empty() {
            return Ok(BatchSendResult::default());
        }

        let chunk_size = chunk_size.unwrap_or(self.batch_chunk_size).max(1);
        let mut all_results = Vec::with_capacity(requests.len());
        let mut chunks_processed = 0;

        for chunk in requests.chunks(chunk_size) {
            let results = self.send_batch_chunk(chunk).await?;
            all_results.extend(results);
            chunks_processed += 1;
        }

        info!(
            total = all_results.len(),
            chunks = chunks_processed,
            "Sent command batch"
        );

        Ok(BatchSendResult {
            total_commands: all_results.len(),
            results: all_results,
            chunks_processed,
        })
    }

    async fn send_batch_chunk(&self, requests: &[SendRequest]) -> RelayResult<Vec<SendResult>> {
        let mut tx = self.pool.begin().await?;
        let mut results = Vec::with_capacity(requests.len());
        let now = Utc::now();

        for (domain, domain_requests) in group_by_domain(requests) {
            let queue_name = queues::command_queue(&domain);

            let command_ids: Vec<Uuid> = domain_requests.iter().map(|r| r.command_id).collect();
            let existing = self
                .commands
                .exists_batch_in(&mut tx, &domain, &command_ids)
                .await?;
            if let Some(dup) = domain_requests
                .iter()
                .find(|r| existing.contains(&r.command_id))
            {
                return Err(RelayError::duplicate_command(&domain, dup.command_id));
            }

            let correlation_ids: Vec<Uuid> = domain_requests
                .iter()
                .map(|r| r.correlation_id.unwrap_or_else(Uuid::new_v4))
                .collect();

            let mut payloads = Vec::with_capacity(domain_requests.len());
            for (request, correlation_id) in domain_requests.iter().zip(&correlation_ids) {
                let envelope = CommandEnvelope {
                    domain: request.domain.clone(),
                    command_type: request.command_type.clone(),
                    command_id: request.command_id,
                    correlation_id: *correlation_id,
                    data: request.data.clone(),
                    reply_to: request.reply_to.clone(),
                };
                payloads.push(envelope.to_value()?);
            }

            let msg_ids = self.pgmq.send_batch_in(&mut tx, &queue_name, &payloads).await?;

            let mut metadata_list = Vec::with_capacity(domain_requests.len());
            let mut audit_entries = Vec::with_capacity(domain_requests.len());
            for ((request, correlation_id), msg_id) in
                domain_requests.iter().zip(&correlation_ids).zip(&msg_ids)
            {
                let metadata = CommandMetadata {
                    domain: request.domain.clone(),
                    command_id: request.command_id,
                    command_type: request.command_type.clone(),
                    status: CommandStatus::Pending,
                    attempts: 0,
                    max_attempts: request.max_attempts.unwrap_or(self.default_max_attempts),
                    msg_id: Some(*msg_id),
                    correlation_id: Some(*correlation_id),
                    reply_to: request.reply_to.clone(),
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                    batch_id: request.batch_id,
                };
                audit_entries.push(AuditEntry::new(
                    request.domain.clone(),
                    request.command_id,
                    AuditEventType::Sent,
                    Some(sent_details(&metadata)),
                ));
                results.push(SendResult {
                    command_id: request.command_id,
                    msg_id: *msg_id,
                });
                metadata_list.push(metadata);
            }

            self.commands
                .save_batch_in(&mut tx, &metadata_list, &queue_name)
                .await?;
            self.audit.log_batch_in(&mut tx, &audit_entries).await?;
            self.pgmq.notify_in(&mut tx, &queue_name).await?;
        }

        tx.commit().await?;
        Ok(results)
    }

    /// Create a batch: the batch row, all contained commands, their SENT
    /// audit events and their queue messages, atomically.
    pub async fn create_batch(
        &self,
        domain: &str,
        commands: Vec<BatchCommand>,
        options: CreateBatchOptions,
    ) -> RelayResult<(Uuid, Vec<SendResult>)> {
        if commands.is_empty() {
            return Err(RelayError::invalid_operation(
                "batch must contain at least one command",
            ));
        }

        let mut seen = std::collections::HashSet::with_capacity(commands.len());
        for command in &commands {
            if !seen.insert(command.command_id) {
                return Err(RelayError::invalid_operation(format!(
                    "duplicate command_id {} within batch",
                    command.command_id
                )));
            }
        }

        let batch_id = options.batch_id.unwrap_or_else(Uuid::new_v4);
        let queue_name = queues::command_queue(domain);
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        if self.batches.exists_in(&mut tx, domain, batch_id).await? {
            return Err(RelayError::invalid_operation(format!(
                "batch {batch_id} already exists in domain '{domain}'"
            )));
        }

        let command_ids: Vec<Uuid> = commands.iter().map(|c| c.command_id).collect();
        let existing = self
            .commands
            .exists_batch_in(&mut tx, domain, &command_ids)
            .await?;
        if let Some(dup) = commands.iter().find(|c| existing.contains(&c.command_id)) {
            return Err(RelayError::duplicate_command(domain, dup.command_id));
        }

        let batch = BatchMetadata {
            domain: domain.to_string(),
            batch_id,
            name: options.name,
            custom_data: options.custom_data,
            status: BatchStatus::Pending,
            total_count: commands.len() as i32,
            completed_count: 0,
            failed_count: 0,
            canceled_count: 0,
            in_troubleshooting_count: 0,
            completion_command: options.completion_command,
            created_at: now,
            started_at: None,
            completed_at: None,
        };
        self.batches.save_in(&mut tx, &batch).await?;

        let correlation_ids: Vec<Uuid> = commands
            .iter()
            .map(|c| c.correlation_id.unwrap_or_else(Uuid::new_v4))
            .collect();

        let mut payloads = Vec::with_capacity(commands.len());
        for (command, correlation_id) in commands.iter().zip(&correlation_ids) {
            let envelope = CommandEnvelope {
                domain: domain.to_string(),
                command_type: command.command_type.clone(),
                command_id: command.command_id,
                correlation_id: *correlation_id,
                data: command.data.clone(),
                reply_to: command.reply_to.clone(),
            };
            payloads.push(envelope.to_value()?);
        }

        let msg_ids = self.pgmq.send_batch_in(&mut tx, &queue_name, &payloads).await?;

        let mut metadata_list = Vec::with_capacity(commands.len());
        let mut audit_entries = Vec::with_capacity(commands.len());
        let mut results = Vec::with_capacity(commands.len());
        for ((command, correlation_id), msg_id) in
            commands.iter().zip(&correlation_ids).zip(&msg_ids)
        {
            let metadata = CommandMetadata {
                domain: domain.to_string(),
                command_id: command.command_id,
                command_type: command.command_type.clone(),
                status: CommandStatus::Pending,
                attempts: 0,
                max_attempts: command.max_attempts.unwrap_or(self.default_max_attempts),
                msg_id: Some(*msg_id),
                correlation_id: Some(*correlation_id),
                reply_to: command.reply_to.clone(),
                last_error: None,
                created_at: now,
                updated_at: now,
                batch_id: Some(batch_id),
            };
            audit_entries.push(AuditEntry::new(
                domain.to_string(),
                command.command_id,
                AuditEventType::Sent,
                Some(sent_details(&metadata)),
            ));
            results.push(SendResult {
                command_id: command.command_id,
                msg_id: *msg_id,
            });
            metadata_list.push(metadata);
        }

        self.commands
            .save_batch_in(&mut tx, &metadata_list, &queue_name)
            .await?;
        self.audit.log_batch_in(&mut tx, &audit_entries).await?;
        self.pgmq.notify_in(&mut tx, &queue_name).await?;

        tx.commit().await?;

        info!(
            domain = %domain,
            batch_id = %batch_id,
            total = results.len(),
            "Created batch"
        );
        Ok((batch_id, results))
    }

    /// Fire the persisted completion command of a batch that just became
    /// terminal, within the same transaction that flipped it.
    pub async fn fire_batch_completion_in(
        &self,
        conn: &mut PgConnection,
        domain: &str,
        batch_id: Uuid,
    ) -> RelayResult<Option<SendResult>> {
        let Some(batch) = self.batches.get_in(conn, domain, batch_id).await? else {
            return Ok(None);
        };
        let Some(completion) = batch.completion_command else {
            return Ok(None);
        };

        let mut request = SendRequest::new(
            domain,
            completion.command_type,
            Uuid::new_v4(),
            completion.data,
        )
        .with_correlation_id(batch_id);
        if let Some(reply_to) = completion.reply_to {
            request = request.with_reply_to(reply_to);
        }

        let result = self.send_in(conn, &request).await?;
        debug!(
            domain = %domain,
            batch_id = %batch_id,
            command_id = %result.command_id,
            "Fired batch completion command"
        );
        Ok(Some(result))
    }

    // -------------------------------------------------------------------
    // Read surface
    // -------------------------------------------------------------------

    pub async fn get_command(
        &self,
        domain: &str,
        command_id: Uuid,
    ) -> RelayResult<Option<CommandMetadata>> {
        self.commands.get(domain, command_id).await
    }

    pub async fn command_exists(&self, domain: &str, command_id: Uuid) -> RelayResult<bool> {
        self.commands.exists(domain, command_id).await
    }

    /// All audit events for a command in chronological order.
    pub async fn get_audit_trail(
        &self,
        command_id: Uuid,
        domain: Option<&str>,
    ) -> RelayResult<Vec<AuditEvent>> {
        self.audit.get_events(command_id, domain).await
    }

    pub async fn query_commands(&self, filter: &CommandQuery) -> RelayResult<Vec<CommandMetadata>> {
        self.commands.query(filter).await
    }

    pub async fn get_batch(&self, domain: &str, batch_id: Uuid) -> RelayResult<Option<BatchMetadata>> {
        self.batches.get(domain, batch_id).await
    }

    pub async fn list_batches(
        &self,
        domain: &str,
        status: Option<BatchStatus>,
        limit: i64,
        offset: i64,
    ) -> RelayResult<Vec<BatchMetadata>> {
        self.batches.list_batches(domain, status, limit, offset).await
    }
}

fn map_unique_violation(err: RelayError, domain: &str, command_id: Uuid) -> RelayError {
    if let RelayError::Database(sqlx::Error::Database(db_err)) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return RelayError::duplicate_command(domain, command_id);
        }
    }
    err
}

fn sent_details(metadata: &CommandMetadata) -> Value {
    let mut details = json!({
        "command_type": metadata.command_type,
        "correlation_id": metadata.correlation_id,
        "reply_to": metadata.reply_to,
        "msg_id": metadata.msg_id,
    });
    if let Some(batch_id) = metadata.batch_id {
        details["batch_id"] = json!(batch_id);
    }
    details
}

/// Group requests by domain, preserving first-seen domain order and the
/// request order within each domain.
fn group_by_domain(requests: &[SendRequest]) -> Vec<(String, Vec<&SendRequest>)> {
    let mut groups: Vec<(String, Vec<&SendRequest>)> = Vec::new();
    for request in requests {
        match groups.iter_mut().find(|(domain, _)| domain == &request.domain) {
            Some((_, group)) => group.push(request),
            None => groups.push((request.domain.clone(), vec![request])),
        }
    }
    groups
}
