//! # Worker Runtime
//!
//! Assembles a node's workers, reply routers and watchdogs from
//! [`RelayConfig`], runs them on the shared pool, and coordinates
//! graceful shutdown. Used by the `relay-worker` binary; embedders with
//! custom wiring can construct [`Worker`]/[`ReplyRouter`] directly.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::task::JoinHandle;
use tracing::{error, info};

use relay_bus::CommandBus;
use relay_shared::{RelayConfig, RelayResult};

use crate::handler::HandlerRegistry;
use crate::process::{ProcessManagerRegistry, ProcessRuntime, ReplyRouter, ReplyRouterConfig};
use crate::watchdog::Watchdog;
use crate::worker::{Worker, WorkerConfig};

/// Open the node's connection pool with the configured per-statement
/// timeout applied to every connection.
///
/// Size the pool for (worker concurrency x domains) + router concurrency
/// + one LISTEN connection per worker/router + submission headroom.
pub async fn connect_pool(config: &RelayConfig) -> RelayResult<PgPool> {
    let statement_timeout_ms = config.database.statement_timeout_ms;
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                sqlx::query(&format!("SET statement_timeout = {statement_timeout_ms}"))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect(&config.database.url)
        .await?;
    Ok(pool)
}

/// One worker + one reply router per configured domain, each under a
/// watchdog when enabled.
pub struct WorkerRuntime {
    config: RelayConfig,
    bus: CommandBus,
    process_runtime: ProcessRuntime,
    workers: Vec<Arc<Worker>>,
    routers: Vec<Arc<ReplyRouter>>,
    watchdogs: Vec<Arc<Watchdog>>,
    handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("domains", &self.config.domains)
            .field("workers", &self.workers.len())
            .field("routers", &self.routers.len())
            .finish_non_exhaustive()
    }
}

impl WorkerRuntime {
    pub fn new(
        pool: PgPool,
        config: RelayConfig,
        registry: Arc<HandlerRegistry>,
        managers: Arc<ProcessManagerRegistry>,
    ) -> Self {
        let bus = CommandBus::new(pool)
            .with_default_max_attempts(config.bus.default_max_attempts)
            .with_batch_chunk_size(config.bus.batch_chunk_size);
        let retry_policy = config.retry.policy();

        let mut workers = Vec::with_capacity(config.domains.len());
        let mut routers = Vec::with_capacity(config.domains.len());
        let mut watchdogs = Vec::new();

        for domain in &config.domains {
            let worker_config = WorkerConfig {
                domain: domain.clone(),
                visibility_timeout_seconds: config.worker.visibility_timeout_seconds,
                batch_size: config.worker.batch_size,
                concurrency: config.worker.concurrency,
                poll_interval: Duration::from_millis(config.worker.poll_interval_ms),
                shutdown_timeout: Duration::from_secs(config.worker.shutdown_timeout_seconds),
            };
            let worker = Arc::new(Worker::new(
                bus.clone(),
                registry.clone(),
                retry_policy.clone(),
                worker_config,
            ));

            let router_config = ReplyRouterConfig {
                visibility_timeout_seconds: config.worker.visibility_timeout_seconds,
                poll_interval: Duration::from_millis(config.worker.poll_interval_ms),
                shutdown_timeout: Duration::from_secs(config.worker.shutdown_timeout_seconds),
                ..ReplyRouterConfig::new(domain.clone())
            };
            let router = Arc::new(ReplyRouter::new(
                bus.clone(),
                managers.clone(),
                router_config,
            ));

            if config.watchdog.enabled {
                let interval = Duration::from_secs(config.watchdog.poll_interval_seconds);
                watchdogs.push(Arc::new(Watchdog::new(worker.clone(), interval)));
                watchdogs.push(Arc::new(Watchdog::new(router.clone(), interval)));
            }

            workers.push(worker);
            routers.push(router);
        }

        Self {
            process_runtime: ProcessRuntime::new(bus.clone(), managers),
            bus,
            config,
            workers,
            routers,
            watchdogs,
            handles: Vec::new(),
        }
    }

    pub fn bus(&self) -> &CommandBus {
        &self.bus
    }

    pub fn process_runtime(&self) -> &ProcessRuntime {
        &self.process_runtime
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    pub fn routers(&self) -> &[Arc<ReplyRouter>] {
        &self.routers
    }

    /// Create the domains' queues and start every worker, router and
    /// watchdog.
    pub async fn start(&mut self) -> RelayResult<()> {
        for domain in &self.config.domains {
            self.bus.ensure_domain(domain).await?;
        }

        for worker in &self.workers {
            let worker = worker.clone();
            self.handles.push(tokio::spawn(async move {
                if let Err(e) = worker.run().await {
                    error!(domain = %worker.domain(), error = %e, "Worker exited with error");
                }
            }));
        }
        for router in &self.routers {
            let router = router.clone();
            self.handles.push(tokio::spawn(async move {
                if let Err(e) = router.run().await {
                    error!(domain = %router.domain(), error = %e, "Reply router exited with error");
                }
            }));
        }
        for watchdog in &self.watchdogs {
            self.handles.push(watchdog.clone().spawn());
        }

        info!(
            domains = ?self.config.domains,
            workers = self.workers.len(),
            routers = self.routers.len(),
            watchdogs = self.watchdogs.len(),
            "Runtime started"
        );
        Ok(())
    }

    /// Stop everything and wait for the loops to drain.
    pub async fn shutdown(mut self) {
        info!("Runtime shutting down");
        for watchdog in &self.watchdogs {
            watchdog.stop();
        }
        for worker in &self.workers {
            worker.stop();
        }
        for router in &self.routers {
            router.stop();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        info!("Runtime stopped");
    }
}
