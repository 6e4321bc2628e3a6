//! # Reply Router
//!
//! Consumes a domain's reply queue and advances the addressed processes.
//! Same loop shape as the worker (LISTEN wake-ups, bounded concurrency,
//! cancellable), but each reply is dispatched to a registered process
//! manager and the resulting command issuance + state update commit in
//! one transaction, with the reply message deleted in that same
//! transaction.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use relay_bus::{CommandBus, ProcessRepository, StepInsert};
use relay_pgmq::{PgmqClient, PgmqListener, QueueMessage};
use relay_shared::health::HealthStatus;
use relay_shared::models::{
    CommandError, ErrorKind, ProcessStatus, ReplyEnvelope, SendRequest,
};
use relay_shared::{queues, RelayResult};

use super::ProcessManagerRegistry;
use crate::watchdog::Monitorable;
use crate::worker::{record_infra_failure, record_queue_failure};

/// Per-router configuration.
#[derive(Debug, Clone)]
pub struct ReplyRouterConfig {
    pub domain: String,
    /// The queue this router consumes; defaults to `<domain>__replies`.
    pub reply_queue: String,
    pub visibility_timeout_seconds: i32,
    pub batch_size: i32,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl ReplyRouterConfig {
    pub fn new(domain: impl Into<String>) -> Self {
        let domain = domain.into();
        Self {
            reply_queue: queues::reply_queue(&domain),
            domain,
            visibility_timeout_seconds: 30,
            batch_size: 10,
            concurrency: 2,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_reply_queue(mut self, reply_queue: impl Into<String>) -> Self {
        self.reply_queue = reply_queue.into();
        self
    }
}

/// What happened to one reply; logging/health only.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RouteOutcome {
    /// Dispatched to a manager; process advanced or completed.
    Dispatched,
    /// No correlation id, unknown process or unregistered manager.
    Discarded,
    /// The manager rejected the reply; process FAILED.
    ProcessFailed,
}

/// Router for one (domain, reply queue).
pub struct ReplyRouter {
    config: ReplyRouterConfig,
    inner: Arc<RouterInner>,
    health: Arc<HealthStatus>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
}

struct RouterInner {
    domain: String,
    reply_queue: String,
    bus: CommandBus,
    pgmq: PgmqClient,
    processes: ProcessRepository,
    registry: Arc<ProcessManagerRegistry>,
}

impl std::fmt::Debug for ReplyRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyRouter")
            .field("domain", &self.config.domain)
            .field("reply_queue", &self.config.reply_queue)
            .finish_non_exhaustive()
    }
}

impl ReplyRouter {
    pub fn new(
        bus: CommandBus,
        registry: Arc<ProcessManagerRegistry>,
        config: ReplyRouterConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                domain: config.domain.clone(),
                reply_queue: config.reply_queue.clone(),
                pgmq: bus.queue().clone(),
                processes: ProcessRepository::new(bus.pool().clone()),
                bus,
                registry,
            }),
            health: Arc::new(HealthStatus::new()),
            semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
            cancel: CancellationToken::new(),
            config,
        }
    }

    pub fn domain(&self) -> &str {
        &self.config.domain
    }

    pub fn reply_queue(&self) -> &str {
        &self.config.reply_queue
    }

    pub fn health_status(&self) -> Arc<HealthStatus> {
        self.health.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Run the routing loop until stopped.
    pub async fn run(&self) -> RelayResult<()> {
        let mut listener = PgmqListener::connect(self.inner.pgmq.pool()).await?;
        listener.listen(&self.config.reply_queue).await?;

        info!(
            domain = %self.config.domain,
            reply_queue = %self.config.reply_queue,
            "Reply router started"
        );

        let mut tasks: JoinSet<()> = JoinSet::new();

        while !self.cancel.is_cancelled() {
            while tasks.try_join_next().is_some() {}

            let messages = match self
                .inner
                .pgmq
                .read(
                    &self.config.reply_queue,
                    self.config.visibility_timeout_seconds,
                    self.config.batch_size,
                )
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    error!(
                        reply_queue = %self.config.reply_queue,
                        error = %e,
                        "Reply queue read failed"
                    );
                    record_queue_failure(&self.health, &e);
                    self.wait_for_wakeup(&mut listener).await;
                    continue;
                }
            };

            if messages.is_empty() {
                self.wait_for_wakeup(&mut listener).await;
                continue;
            }

            for msg in messages {
                let permit = tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    permit = self.semaphore.clone().acquire_owned() => {
                        match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        }
                    }
                };

                let inner = self.inner.clone();
                let health = self.health.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    match inner.route_reply(&msg).await {
                        Ok(outcome) => {
                            health.record_success();
                            debug!(
                                reply_queue = %inner.reply_queue,
                                msg_id = msg.msg_id,
                                ?outcome,
                                "Reply routed"
                            );
                        }
                        Err(e) => {
                            record_infra_failure(&health, &e);
                            error!(
                                reply_queue = %inner.reply_queue,
                                msg_id = msg.msg_id,
                                error = %e,
                                "Reply routing failed"
                            );
                        }
                    }
                });
            }
        }

        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                reply_queue = %self.config.reply_queue,
                remaining = tasks.len(),
                "Shutdown timeout expired; detaching in-flight replies"
            );
            tasks.detach_all();
        }

        info!(domain = %self.config.domain, "Reply router stopped");
        Ok(())
    }

    async fn wait_for_wakeup(&self, listener: &mut PgmqListener) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            woke = listener.recv() => {
                if let Err(e) = woke {
                    warn!(
                        reply_queue = %self.config.reply_queue,
                        error = %e,
                        "Listener error; relying on poll interval"
                    );
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
            _ = tokio::time::sleep(self.config.poll_interval) => {}
        }
    }
}

impl RouterInner {
    async fn route_reply(&self, msg: &QueueMessage) -> RelayResult<RouteOutcome> {
        let reply = match ReplyEnvelope::from_value(&msg.message) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    reply_queue = %self.reply_queue,
                    msg_id = msg.msg_id,
                    error = %e,
                    "Unparseable reply; discarding"
                );
                self.pgmq.delete(&self.reply_queue, msg.msg_id).await?;
                return Ok(RouteOutcome::Discarded);
            }
        };

        // The correlation id addresses the process.
        let Some(process_id) = reply.correlation_id else {
            debug!(msg_id = msg.msg_id, "Reply without correlation id; discarding");
            self.pgmq.delete(&self.reply_queue, msg.msg_id).await?;
            return Ok(RouteOutcome::Discarded);
        };

        let Some(process) = self.processes.get(&self.domain, process_id).await? else {
            debug!(
                process_id = %process_id,
                "Reply for unknown process; discarding"
            );
            self.pgmq.delete(&self.reply_queue, msg.msg_id).await?;
            return Ok(RouteOutcome::Discarded);
        };

        let Some(manager) = self.registry.get(&self.domain, &process.process_type) else {
            warn!(
                process_id = %process_id,
                process_type = %process.process_type,
                "No manager registered for process type; discarding reply"
            );
            self.pgmq.delete(&self.reply_queue, msg.msg_id).await?;
            return Ok(RouteOutcome::Discarded);
        };

        let mut tx = self.bus.pool().begin().await?;

        // Re-read under lock; the process may have been advanced by a
        // concurrent router task between the lookup and here.
        let Some(process) = self
            .processes
            .get_for_update_in(&mut tx, &self.domain, process_id)
            .await?
        else {
            self.pgmq.delete_in(&mut tx, &self.reply_queue, msg.msg_id).await?;
            tx.commit().await?;
            return Ok(RouteOutcome::Discarded);
        };

        if process.status.is_terminal() {
            self.pgmq.delete_in(&mut tx, &self.reply_queue, msg.msg_id).await?;
            tx.commit().await?;
            debug!(process_id = %process_id, "Reply for terminal process; discarded");
            return Ok(RouteOutcome::Discarded);
        }

        let Some(current_step) = process.current_step.clone() else {
            self.pgmq.delete_in(&mut tx, &self.reply_queue, msg.msg_id).await?;
            tx.commit().await?;
            warn!(process_id = %process_id, "Process has no open step; reply discarded");
            return Ok(RouteOutcome::Discarded);
        };

        // Stamp the reply onto the open step row.
        self.processes
            .record_reply_in(
                &mut tx,
                &self.domain,
                process_id,
                reply.command_id,
                reply.outcome,
                reply_trail_data(&reply).as_ref(),
            )
            .await?;

        let outcome = match manager.apply_reply(&process.state, &current_step, &reply) {
            Ok((new_state, Some(next_step))) => {
                manager.before_send(&mut tx, &next_step, &new_state).await?;

                let spec = manager.build_command(&next_step, &new_state)?;
                let command_id = Uuid::new_v4();
                let request =
                    SendRequest::new(&self.domain, &spec.command_type, command_id, spec.data.clone())
                        .with_correlation_id(process_id)
                        .with_reply_to(&self.reply_queue);
                self.bus.send_in(&mut tx, &request).await?;

                self.processes
                    .update_state_in(
                        &mut tx,
                        &self.domain,
                        process_id,
                        ProcessStatus::WaitingForReply,
                        Some(&next_step),
                        &new_state,
                    )
                    .await?;
                self.processes
                    .record_step_in(
                        &mut tx,
                        &StepInsert {
                            domain: self.domain.clone(),
                            process_id,
                            step_name: next_step,
                            command_id,
                            command_type: spec.command_type,
                            command_data: Some(spec.data),
                        },
                    )
                    .await?;
                RouteOutcome::Dispatched
            }
            Ok((new_state, None)) => {
                self.processes
                    .complete_in(&mut tx, &self.domain, process_id, &new_state)
                    .await?;
                debug!(process_id = %process_id, "Process completed");
                RouteOutcome::Dispatched
            }
            Err(e) => {
                // The manager rejected the reply: the process fails with
                // the rejection recorded, and the reply is consumed.
                let error = CommandError::new(
                    ErrorKind::Permanent,
                    "PROCESS_REPLY_REJECTED",
                    e.to_string(),
                );
                self.processes
                    .fail_in(&mut tx, &self.domain, process_id, &error)
                    .await?;
                warn!(
                    process_id = %process_id,
                    error = %e,
                    "Process manager rejected reply; process failed"
                );
                RouteOutcome::ProcessFailed
            }
        };

        self.pgmq.delete_in(&mut tx, &self.reply_queue, msg.msg_id).await?;
        tx.commit().await?;

        Ok(outcome)
    }
}

/// What lands in the step trail's reply_data column.
fn reply_trail_data(reply: &ReplyEnvelope) -> Option<Value> {
    match (&reply.result, &reply.reason) {
        (Some(result), _) => Some(result.clone()),
        (None, Some(reason)) => Some(json!({"reason": reason})),
        (None, None) => None,
    }
}

impl Monitorable for ReplyRouter {
    fn name(&self) -> &str {
        &self.config.reply_queue
    }

    fn health(&self) -> Arc<HealthStatus> {
        self.health.clone()
    }

    fn stop(&self) {
        ReplyRouter::stop(self);
    }
}
