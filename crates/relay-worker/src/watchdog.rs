//! # Watchdog
//!
//! Supervision of workers and routers through their health state. The
//! watchdog polls on a fixed interval; when a target goes CRITICAL it
//! triggers recovery exactly once per detection: a restart callback when
//! configured, otherwise a stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relay_shared::health::{HealthState, HealthStatus};

/// Something the watchdog can supervise.
pub trait Monitorable: Send + Sync {
    fn name(&self) -> &str;
    fn health(&self) -> Arc<HealthStatus>;
    fn stop(&self);
}

/// Callback invoked instead of a plain stop when a target goes critical.
pub type RestartCallback = Arc<dyn Fn() + Send + Sync>;

/// Supervisor for a single worker or router.
pub struct Watchdog {
    target: Arc<dyn Monitorable>,
    poll_interval: Duration,
    restart: Option<RestartCallback>,
    recovery_triggered: AtomicBool,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("target", &self.target.name())
            .field("poll_interval", &self.poll_interval)
            .field(
                "recovery_triggered",
                &self.recovery_triggered.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl Watchdog {
    pub fn new(target: Arc<dyn Monitorable>, poll_interval: Duration) -> Self {
        Self {
            target,
            poll_interval,
            restart: None,
            recovery_triggered: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Prefer restarting over stopping when the target goes critical.
    pub fn with_restart(mut self, callback: RestartCallback) -> Self {
        self.restart = Some(callback);
        self
    }

    /// Whether recovery has fired since the watchdog started.
    pub fn recovery_triggered(&self) -> bool {
        self.recovery_triggered.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Spawn the monitor loop.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let watchdog = self;
        tokio::spawn(async move {
            info!(
                target = %watchdog.target.name(),
                interval_secs = watchdog.poll_interval.as_secs(),
                "Watchdog started"
            );
            loop {
                tokio::select! {
                    _ = watchdog.cancel.cancelled() => break,
                    _ = tokio::time::sleep(watchdog.poll_interval) => {}
                }
                watchdog.check_health();
            }
            info!(target = %watchdog.target.name(), "Watchdog stopped");
        })
    }

    fn check_health(&self) {
        match self.target.health().state() {
            HealthState::Healthy => {}
            HealthState::Degraded => {
                warn!(
                    target = %self.target.name(),
                    "Target degraded; monitoring"
                );
            }
            HealthState::Critical => {
                self.trigger_recovery();
            }
        }
    }

    /// One-shot per detection so a critical target is not restarted in a
    /// loop while it recovers.
    fn trigger_recovery(&self) {
        if self.recovery_triggered.swap(true, Ordering::SeqCst) {
            return;
        }

        let snapshot = self.target.health().snapshot();
        error!(
            target = %self.target.name(),
            stuck_tasks = snapshot.stuck_tasks,
            pool_exhaustions = snapshot.pool_exhaustions,
            consecutive_failures = snapshot.consecutive_failures,
            "Target critical; triggering recovery"
        );

        match &self.restart {
            Some(restart) => restart(),
            None => self.target.stop(),
        }
    }
}
