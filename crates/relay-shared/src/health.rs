//! # Worker Health Tracking
//!
//! Per-worker counters that classify a dispatch loop as HEALTHY, DEGRADED
//! or CRITICAL. A supervising watchdog polls the state and recovers
//! workers that go critical.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Aggregate health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Healthy,
    /// Sustained consecutive failures; still making progress attempts.
    Degraded,
    /// Stuck slots or pool exhaustion; the watchdog should intervene.
    Critical,
}

/// Consecutive failures before HEALTHY -> DEGRADED.
pub const FAILURE_THRESHOLD: u32 = 10;
/// Stuck in-flight slots before -> CRITICAL.
pub const STUCK_THRESHOLD: u32 = 3;
/// Pool exhaustions before -> CRITICAL.
pub const EXHAUSTION_THRESHOLD: u32 = 5;

#[derive(Debug)]
struct HealthInner {
    state: HealthState,
    consecutive_failures: u32,
    stuck_tasks: u32,
    pool_exhaustions: u32,
    total_successes: u64,
    total_failures: u64,
    last_success: Option<DateTime<Utc>>,
}

impl HealthInner {
    fn evaluate_state(&mut self) {
        self.state = if self.stuck_tasks >= STUCK_THRESHOLD
            || self.pool_exhaustions >= EXHAUSTION_THRESHOLD
        {
            HealthState::Critical
        } else if self.consecutive_failures >= FAILURE_THRESHOLD {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };
    }
}

/// A serializable point-in-time view of a worker's health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub stuck_tasks: u32,
    pub pool_exhaustions: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_success: Option<DateTime<Utc>>,
}

/// Shared health tracker; cheap to clone behind an `Arc`.
#[derive(Debug)]
pub struct HealthStatus {
    inner: Mutex<HealthInner>,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HealthInner {
                state: HealthState::Healthy,
                consecutive_failures: 0,
                stuck_tasks: 0,
                pool_exhaustions: 0,
                total_successes: 0,
                total_failures: 0,
                last_success: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HealthInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A message was processed to a classified outcome. Resets the
    /// consecutive-failure streak and can recover DEGRADED -> HEALTHY.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.total_successes += 1;
        inner.last_success = Some(Utc::now());
        inner.evaluate_state();
    }

    /// An infrastructure failure escaped classification (DB error, queue
    /// error) -- not a handler failure, which is a classified outcome.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        inner.total_failures += 1;
        inner.evaluate_state();
    }

    /// An in-flight slot exceeded the stuck threshold (about 3x the
    /// visibility timeout).
    pub fn record_stuck_task(&self) {
        let mut inner = self.lock();
        inner.stuck_tasks += 1;
        inner.evaluate_state();
    }

    /// A connection could not be acquired from the pool.
    pub fn record_pool_exhaustion(&self) {
        let mut inner = self.lock();
        inner.pool_exhaustions += 1;
        inner.evaluate_state();
    }

    /// Clear the stuck-slot counter (after a restart or manual recovery).
    pub fn reset_stuck_tasks(&self) {
        let mut inner = self.lock();
        inner.stuck_tasks = 0;
        inner.evaluate_state();
    }

    /// Clear the pool-exhaustion counter.
    pub fn reset_pool_exhaustions(&self) {
        let mut inner = self.lock();
        inner.pool_exhaustions = 0;
        inner.evaluate_state();
    }

    pub fn state(&self) -> HealthState {
        self.lock().state
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let inner = self.lock();
        HealthSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            stuck_tasks: inner.stuck_tasks,
            pool_exhaustions: inner.pool_exhaustions,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            last_success: inner.last_success,
        }
    }
}
