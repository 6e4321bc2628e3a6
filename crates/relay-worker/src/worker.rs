//! # Worker
//!
//! The bounded-concurrency dispatch engine: one worker per domain,
//! reading `<domain>__commands` in batches, spawning one task per message
//! behind a semaphore, and waking between polls on LISTEN notifications.
//!
//! NOTIFY is lossy, so the poll interval is the reliability floor; the
//! notification only shortens the latency between enqueue and dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relay_bus::CommandBus;
use relay_pgmq::{PgmqClient, PgmqError, PgmqListener};
use relay_shared::health::HealthStatus;
use relay_shared::{queues, RelayError, RelayResult, RetryPolicy};

use crate::dispatch::Dispatcher;
use crate::handler::HandlerRegistry;
use crate::watchdog::Monitorable;

/// A slot is considered stuck when it has been in flight for this many
/// multiples of the visibility timeout.
const STUCK_MULTIPLIER: u32 = 3;

/// Feed an infrastructure error into the health counters: failed pool
/// acquisition has its own counter (and critical threshold), everything
/// else counts toward the consecutive-failure streak.
pub(crate) fn record_infra_failure(health: &HealthStatus, error: &RelayError) {
    if matches!(
        error,
        RelayError::Database(sqlx::Error::PoolTimedOut)
            | RelayError::Queue(PgmqError::Database(sqlx::Error::PoolTimedOut))
    ) {
        health.record_pool_exhaustion();
    } else {
        health.record_failure();
    }
}

pub(crate) fn record_queue_failure(health: &HealthStatus, error: &PgmqError) {
    if matches!(error, PgmqError::Database(sqlx::Error::PoolTimedOut)) {
        health.record_pool_exhaustion();
    } else {
        health.record_failure();
    }
}

/// Per-worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub domain: String,
    /// Seconds a read message stays invisible to other readers.
    pub visibility_timeout_seconds: i32,
    /// Messages fetched per poll.
    pub batch_size: i32,
    /// Bounded concurrency: in-flight messages per worker.
    pub concurrency: usize,
    /// Poll interval when no notifications arrive.
    pub poll_interval: Duration,
    /// How long `stop` waits for in-flight work before detaching it.
    pub shutdown_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            visibility_timeout_seconds: 30,
            batch_size: 10,
            concurrency: 4,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct InFlightSlot {
    started: Instant,
    flagged_stuck: bool,
}

/// The dispatch engine for one domain.
pub struct Worker {
    config: WorkerConfig,
    queue_name: String,
    dispatcher: Arc<Dispatcher>,
    pgmq: PgmqClient,
    health: Arc<HealthStatus>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    in_flight: Arc<Mutex<HashMap<u64, InFlightSlot>>>,
    next_slot: AtomicU64,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("domain", &self.config.domain)
            .field("queue_name", &self.queue_name)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(
        bus: CommandBus,
        registry: Arc<HandlerRegistry>,
        retry_policy: RetryPolicy,
        config: WorkerConfig,
    ) -> Self {
        let queue_name = queues::command_queue(&config.domain);
        let dispatcher = Arc::new(Dispatcher::new(
            config.domain.clone(),
            bus.clone(),
            registry,
            retry_policy,
        ));

        Self {
            queue_name,
            pgmq: bus.queue().clone(),
            dispatcher,
            health: Arc::new(HealthStatus::new()),
            semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
            cancel: CancellationToken::new(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_slot: AtomicU64::new(0),
            config,
        }
    }

    pub fn domain(&self) -> &str {
        &self.config.domain
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn health_status(&self) -> Arc<HealthStatus> {
        self.health.clone()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Signal the loop to stop accepting work. `run` then drains in-flight
    /// tasks up to the configured shutdown timeout.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run the dispatch loop until [`Worker::stop`] is called.
    ///
    /// Returns when in-flight work has drained (or the shutdown timeout
    /// expired; leftover messages redeliver via their visibility timeout).
    pub async fn run(&self) -> RelayResult<()> {
        let mut listener = PgmqListener::connect(self.pgmq.pool()).await?;
        listener.listen(&self.queue_name).await?;

        info!(
            domain = %self.config.domain,
            queue = %self.queue_name,
            concurrency = self.config.concurrency,
            batch_size = self.config.batch_size,
            "Worker started"
        );

        let mut tasks: JoinSet<()> = JoinSet::new();

        while !self.cancel.is_cancelled() {
            while tasks.try_join_next().is_some() {}
            self.check_stuck_slots();

            let messages = match self
                .pgmq
                .read(
                    &self.queue_name,
                    self.config.visibility_timeout_seconds,
                    self.config.batch_size,
                )
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    error!(
                        domain = %self.config.domain,
                        error = %e,
                        "Queue read failed"
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
                            // Semaphore closed only on teardown
                            Err(_) => break,
                        }
                    }
                };

                let slot_id = self.next_slot.fetch_add(1, Ordering::Relaxed);
                self.track_slot(slot_id);

                let dispatcher = self.dispatcher.clone();
                let health = self.health.clone();
                let in_flight = self.in_flight.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    match dispatcher.process_message(&msg).await {
                        Ok(outcome) => {
                            health.record_success();
                            debug!(
                                domain = %dispatcher.domain(),
                                msg_id = msg.msg_id,
                                ?outcome,
                                "Message processed"
                            );
                        }
                        Err(e) => {
                            // Infrastructure error: the message stays
                            // reserved and redelivers when its visibility
                            // timeout expires.
                            record_infra_failure(&health, &e);
                            error!(
                                domain = %dispatcher.domain(),
                                msg_id = msg.msg_id,
                                error = %e,
                                "Message processing failed"
                            );
                        }
                    }
                    in_flight
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .remove(&slot_id);
                });
            }
        }

        self.drain(tasks).await;
        info!(domain = %self.config.domain, "Worker stopped");
        Ok(())
    }

    /// Block until a notification, the poll interval, or shutdown.
    async fn wait_for_wakeup(&self, listener: &mut PgmqListener) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            woke = listener.recv() => {
                match woke {
                    Ok(channel) => {
                        debug!(channel = %channel, "Notification wake-up");
                    }
                    Err(e) => {
                        // Lost LISTEN connection; fall back to polling.
                        warn!(
                            domain = %self.config.domain,
                            error = %e,
                            "Listener error; relying on poll interval"
                        );
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                }
            }
            _ = tokio::time::sleep(self.config.poll_interval) => {}
        }
    }

    fn track_slot(&self, slot_id: u64) {
        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(
                slot_id,
                InFlightSlot {
                    started: Instant::now(),
                    flagged_stuck: false,
                },
            );
    }

    /// Flag slots whose elapsed time exceeds 3x the visibility timeout.
    /// Each slot is counted once.
    fn check_stuck_slots(&self) {
        let threshold = Duration::from_secs(
            self.config.visibility_timeout_seconds.max(1) as u64 * STUCK_MULTIPLIER as u64,
        );
        let mut slots = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        for (slot_id, slot) in slots.iter_mut() {
            if !slot.flagged_stuck && slot.started.elapsed() > threshold {
                slot.flagged_stuck = true;
                warn!(
                    domain = %self.config.domain,
                    slot_id,
                    elapsed_secs = slot.started.elapsed().as_secs(),
                    "In-flight slot exceeded stuck threshold"
                );
                self.health.record_stuck_task();
            }
        }
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }
        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        match drained {
            Ok(()) => debug!(domain = %self.config.domain, "In-flight work drained"),
            Err(_) => {
                // Leftover transactions finish on their own; their queue
                // messages redeliver after the visibility timeout.
                warn!(
                    domain = %self.config.domain,
                    remaining = tasks.len(),
                    "Shutdown timeout expired; detaching in-flight tasks"
                );
                tasks.detach_all();
            }
        }
    }
}

impl Monitorable for Worker {
    fn name(&self) -> &str {
        &self.config.domain
    }

    fn health(&self) -> Arc<HealthStatus> {
        self.health.clone()
    }

    fn stop(&self) {
        Worker::stop(self);
    }
}
