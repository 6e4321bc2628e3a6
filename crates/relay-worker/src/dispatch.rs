//! # Per-message Dispatch Pipeline
//!
//! Processing of one queue message, split into short transactions so
//! handler I/O never runs inside a database transaction:
//!
//! 1. Receive transaction: `sp_receive_command` (archives redeliveries of
//!    terminal commands), RECEIVED audit, batch receive counter.
//! 2. Handler invocation, outside any transaction; panics are caught and
//!    classified transient.
//! 3. Finish transaction, by outcome class: delete/archive the message,
//!    `sp_finish_command` or `sp_fail_command`, reply emission, backoff
//!    via set-visibility, batch completion firing.
//!
//! Infrastructure errors propagate to the worker task (which records a
//! health failure and lets the visibility timeout redeliver); handler
//! failures never do -- they are classified outcomes.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::{json, Value};
use sqlx::postgres::PgConnection;
use tracing::{debug, warn};

use relay_bus::{AuditLogger, BatchRepository, CommandBus, CommandRepository};
use relay_pgmq::{PgmqClient, QueueMessage};
use relay_shared::models::{
    AuditEventType, CommandEnvelope, CommandMetadata, CommandStatus, ErrorKind, ReplyEnvelope,
};
use relay_shared::{queues, RelayResult, RetryPolicy};

use crate::handler::{HandlerContext, HandlerError, HandlerRegistry};

/// Classified result of processing one message; used for logging and
/// health accounting, never surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler succeeded; command COMPLETED, message deleted.
    Completed,
    /// Transient failure with attempts remaining; redelivery deferred.
    RetryScheduled { delay_seconds: i32 },
    /// Permanent failure or retry exhaustion; command in the TSQ.
    MovedToTsq { exhausted: bool },
    /// Business-rule rejection; command FAILED, no retry.
    BusinessRuleFailed,
    /// Unparseable payload; archived without touching command state.
    Poison,
    /// Redelivery of a terminal command; archived, no state change.
    TerminalRedelivery,
}

/// Stateless per-message processor shared by all of a worker's tasks.
pub struct Dispatcher {
    domain: String,
    queue_name: String,
    bus: CommandBus,
    pgmq: PgmqClient,
    commands: CommandRepository,
    audit: AuditLogger,
    batches: BatchRepository,
    registry: Arc<HandlerRegistry>,
    retry_policy: RetryPolicy,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("domain", &self.domain)
            .field("queue_name", &self.queue_name)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        domain: impl Into<String>,
        bus: CommandBus,
        registry: Arc<HandlerRegistry>,
        retry_policy: RetryPolicy,
    ) -> Self {
        let domain = domain.into();
        Self {
            queue_name: queues::command_queue(&domain),
            pgmq: bus.queue().clone(),
            commands: bus.commands().clone(),
            audit: bus.audit().clone(),
            batches: bus.batches().clone(),
            bus,
            domain,
            registry,
            retry_policy,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Process one message end to end.
    ///
    /// Only infrastructure errors (database/queue) escape; every handler
    /// outcome is classified and recorded.
    pub async fn process_message(&self, msg: &QueueMessage) -> RelayResult<DispatchOutcome> {
        let envelope = match CommandEnvelope::from_value(&msg.message) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    queue = %self.queue_name,
                    msg_id = msg.msg_id,
                    error = %e,
                    "Poison message; archiving"
                );
                self.pgmq.archive(&self.queue_name, msg.msg_id).await?;
                return Ok(DispatchOutcome::Poison);
            }
        };

        // Receive transaction: atomic transition to IN_PROGRESS.
        let mut tx = self.bus.pool().begin().await?;
        let metadata = match self
            .commands
            .sp_receive_command_in(&mut tx, &self.domain, envelope.command_id, Some(msg.msg_id), None)
            .await?
        {
            Some(metadata) => metadata,
            None => {
                // Terminal (or unknown) command: redelivery after a
                // visibility timeout raced a finished transition. Archive
                // so nothing regresses.
                self.pgmq
                    .archive_in(&mut tx, &self.queue_name, msg.msg_id)
                    .await?;
                tx.commit().await?;
                debug!(
                    command_id = %envelope.command_id,
                    msg_id = msg.msg_id,
                    "Redelivery of terminal command archived"
                );
                return Ok(DispatchOutcome::TerminalRedelivery);
            }
        };

        self.audit
            .log_in(
                &mut tx,
                &self.domain,
                envelope.command_id,
                AuditEventType::Received,
                Some(&json!({"attempt": metadata.attempts, "msg_id": msg.msg_id})),
            )
            .await?;

        if let Some(batch_id) = metadata.batch_id {
            self.batches
                .update_on_receive_in(&mut tx, &self.domain, batch_id)
                .await?;
        }
        tx.commit().await?;

        // Handler invocation, outside any transaction.
        let ctx = HandlerContext {
            attempt: metadata.attempts,
            max_attempts: metadata.max_attempts,
            msg_id: msg.msg_id,
        };
        let result = self.invoke_handler(&envelope, ctx).await;

        // Finish transaction by classification.
        match result {
            Ok(result_value) => self.complete(&envelope, &metadata, msg, result_value).await,
            Err(err) => match err.kind() {
                ErrorKind::Permanent => {
                    self.move_to_tsq(&envelope, &metadata, msg, &err, false).await
                }
                ErrorKind::BusinessRule => {
                    self.business_rule_fail(&envelope, &metadata, msg, &err).await
                }
                ErrorKind::Transient => {
                    if self.retry_policy.should_retry(
                        metadata.attempts,
                        metadata.max_attempts,
                        ErrorKind::Transient,
                    ) {
                        self.schedule_retry(&envelope, &metadata, msg, &err).await
                    } else {
                        self.move_to_tsq(&envelope, &metadata, msg, &err, true).await
                    }
                }
            },
        }
    }

    async fn invoke_handler(
        &self,
        envelope: &CommandEnvelope,
        ctx: HandlerContext,
    ) -> Result<Value, HandlerError> {
        let Some(handler) = self.registry.get(&self.domain, &envelope.command_type) else {
            // Surfaced as transient so an operator can register the
            // handler and retry from the TSQ after exhaustion.
            return Err(HandlerError::transient(
                "HANDLER_NOT_FOUND",
                format!(
                    "no handler registered for ({}, {})",
                    self.domain, envelope.command_type
                ),
            ));
        };

        match AssertUnwindSafe(handler.handle(envelope.clone(), ctx))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                warn!(
                    domain = %self.domain,
                    command_type = %envelope.command_type,
                    command_id = %envelope.command_id,
                    panic = %message,
                    "Handler panicked; classifying as transient"
                );
                Err(HandlerError::transient("HANDLER_PANIC", message))
            }
        }
    }

    async fn complete(
        &self,
        envelope: &CommandEnvelope,
        metadata: &CommandMetadata,
        msg: &QueueMessage,
        result: Value,
    ) -> RelayResult<DispatchOutcome> {
        let mut tx = self.bus.pool().begin().await?;

        self.pgmq
            .delete_in(&mut tx, &self.queue_name, msg.msg_id)
            .await?;

        let batch_terminal = self
            .commands
            .sp_finish_command_in(
                &mut tx,
                &self.domain,
                envelope.command_id,
                CommandStatus::Completed,
                AuditEventType::Completed,
                None,
                Some(&json!({"attempt": metadata.attempts, "msg_id": msg.msg_id})),
                metadata.batch_id,
            )
            .await?;

        if let Some(reply_to) = &metadata.reply_to {
            let reply = ReplyEnvelope::success(
                envelope.command_id,
                metadata.correlation_id,
                Some(result),
            );
            self.emit_reply(&mut tx, reply_to, &reply).await?;
        }

        if batch_terminal {
            if let Some(batch_id) = metadata.batch_id {
                self.bus
                    .fire_batch_completion_in(&mut tx, &self.domain, batch_id)
                    .await?;
            }
        }

        tx.commit().await?;
        debug!(
            domain = %self.domain,
            command_id = %envelope.command_id,
            attempt = metadata.attempts,
            "Command completed"
        );
        Ok(DispatchOutcome::Completed)
    }

    async fn schedule_retry(
        &self,
        envelope: &CommandEnvelope,
        metadata: &CommandMetadata,
        msg: &QueueMessage,
        err: &HandlerError,
    ) -> RelayResult<DispatchOutcome> {
        let delay_seconds = self.retry_policy.next_delay_seconds(metadata.attempts);
        let error = err.to_command_error();

        let mut tx = self.bus.pool().begin().await?;

        self.commands
            .sp_fail_command_in(
                &mut tx,
                &self.domain,
                envelope.command_id,
                &error,
                metadata.attempts,
                None,
                Some(msg.msg_id),
            )
            .await?;

        self.audit
            .log_in(
                &mut tx,
                &self.domain,
                envelope.command_id,
                AuditEventType::Failed,
                Some(&json!({
                    "attempt": metadata.attempts,
                    "error_type": error.kind.as_str(),
                    "error_code": error.code,
                    "error_msg": error.message,
                })),
            )
            .await?;
        self.audit
            .log_in(
                &mut tx,
                &self.domain,
                envelope.command_id,
                AuditEventType::RetryScheduled,
                Some(&json!({
                    "attempt": metadata.attempts,
                    "retry_delay_seconds": delay_seconds,
                    "msg_id": msg.msg_id,
                })),
            )
            .await?;

        self.pgmq
            .set_visibility_in(&mut tx, &self.queue_name, msg.msg_id, delay_seconds)
            .await?;

        tx.commit().await?;
        debug!(
            domain = %self.domain,
            command_id = %envelope.command_id,
            attempt = metadata.attempts,
            delay_seconds,
            "Transient failure; retry scheduled"
        );
        Ok(DispatchOutcome::RetryScheduled { delay_seconds })
    }

    async fn move_to_tsq(
        &self,
        envelope: &CommandEnvelope,
        metadata: &CommandMetadata,
        msg: &QueueMessage,
        err: &HandlerError,
        exhausted: bool,
    ) -> RelayResult<DispatchOutcome> {
        let error = err.to_command_error();
        let reason = if exhausted { "EXHAUSTED" } else { "PERMANENT" };

        let mut details = json!({
            "reason": reason,
            "error_type": error.kind.as_str(),
            "error_code": error.code,
            "error_msg": error.message,
        });
        if let Some(extra) = err.details() {
            details["error_details"] = extra.clone();
        }
        if let Some(batch_id) = metadata.batch_id {
            details["batch_id"] = json!(batch_id);
        }

        let mut tx = self.bus.pool().begin().await?;

        if exhausted {
            self.audit
                .log_in(
                    &mut tx,
                    &self.domain,
                    envelope.command_id,
                    AuditEventType::Failed,
                    Some(&json!({
                        "attempt": metadata.attempts,
                        "error_type": error.kind.as_str(),
                        "error_code": error.code,
                        "error_msg": error.message,
                    })),
                )
                .await?;
            self.audit
                .log_in(
                    &mut tx,
                    &self.domain,
                    envelope.command_id,
                    AuditEventType::RetryExhausted,
                    Some(&json!({
                        "attempt": metadata.attempts,
                        "max_attempts": metadata.max_attempts,
                    })),
                )
                .await?;
        }

        self.pgmq
            .archive_in(&mut tx, &self.queue_name, msg.msg_id)
            .await?;

        // The finish procedure also feeds the batch's
        // in_troubleshooting counter for IN_TROUBLESHOOTING_QUEUE.
        self.commands
            .sp_finish_command_in(
                &mut tx,
                &self.domain,
                envelope.command_id,
                CommandStatus::InTroubleshootingQueue,
                AuditEventType::MovedToTsq,
                Some(&error),
                Some(&details),
                metadata.batch_id,
            )
            .await?;

        tx.commit().await?;
        debug!(
            domain = %self.domain,
            command_id = %envelope.command_id,
            reason,
            "Command moved to troubleshooting queue"
        );
        Ok(DispatchOutcome::MovedToTsq { exhausted })
    }

    async fn business_rule_fail(
        &self,
        envelope: &CommandEnvelope,
        metadata: &CommandMetadata,
        msg: &QueueMessage,
        err: &HandlerError,
    ) -> RelayResult<DispatchOutcome> {
        let error = err.to_command_error();
        let mut details = json!({
            "attempt": metadata.attempts,
            "error_code": error.code,
            "error_msg": error.message,
        });
        if let Some(extra) = err.details() {
            details["error_details"] = extra.clone();
        }

        let mut tx = self.bus.pool().begin().await?;

        self.pgmq
            .archive_in(&mut tx, &self.queue_name, msg.msg_id)
            .await?;

        // FAILED deliberately leaves batch counters alone: a business-rule
        // rejection is an expected negative outcome, not a batch failure.
        self.commands
            .sp_finish_command_in(
                &mut tx,
                &self.domain,
                envelope.command_id,
                CommandStatus::Failed,
                AuditEventType::BusinessRuleFailed,
                Some(&error),
                Some(&details),
                metadata.batch_id,
            )
            .await?;

        tx.commit().await?;
        debug!(
            domain = %self.domain,
            command_id = %envelope.command_id,
            code = %error.code,
            "Business rule rejection"
        );
        Ok(DispatchOutcome::BusinessRuleFailed)
    }

    async fn emit_reply(
        &self,
        conn: &mut PgConnection,
        reply_to: &str,
        reply: &ReplyEnvelope,
    ) -> RelayResult<()> {
        self.pgmq.send_in(conn, reply_to, &reply.to_value()?).await?;
        self.pgmq.notify_in(conn, reply_to).await?;
        Ok(())
    }
}
