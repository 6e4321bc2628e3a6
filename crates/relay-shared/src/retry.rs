//! # Retry Policy
//!
//! Pure mapping from (attempt, max_attempts, error kind) to a retry
//! decision, plus the backoff delay applied by deferring the queue
//! message's visibility.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::ErrorKind;

/// How the delay before redelivery grows with each attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Backoff {
    /// Explicit per-attempt delays in seconds; attempts beyond the end of
    /// the schedule reuse the last entry.
    Schedule(Vec<u64>),
    /// base * multiplier^(attempt - 1), clamped to max.
    Exponential {
        base_delay_ms: u64,
        multiplier: f64,
        max_delay_ms: u64,
    },
}

/// Retry decision policy shared by all workers of a runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(1_000, 2.0, 300_000)
    }
}

impl RetryPolicy {
    /// Fixed per-attempt schedule, in seconds.
    pub fn with_schedule(schedule: Vec<u64>) -> Self {
        Self {
            backoff: Backoff::Schedule(schedule),
        }
    }

    /// Exponential backoff with a clamp.
    pub fn exponential(base_delay_ms: u64, multiplier: f64, max_delay_ms: u64) -> Self {
        Self {
            backoff: Backoff::Exponential {
                base_delay_ms,
                multiplier,
                max_delay_ms,
            },
        }
    }

    pub fn from_backoff(backoff: Backoff) -> Self {
        Self { backoff }
    }

    /// Whether a failed attempt should be retried.
    ///
    /// PERMANENT and BUSINESS_RULE failures are never retried; TRANSIENT
    /// failures retry while attempts remain.
    pub fn should_retry(&self, attempt: i32, max_attempts: i32, kind: ErrorKind) -> bool {
        match kind {
            ErrorKind::Permanent | ErrorKind::BusinessRule => false,
            ErrorKind::Transient => attempt < max_attempts,
        }
    }

    /// Delay before the message becomes visible again after the given
    /// (1-based) failed attempt.
    pub fn next_delay(&self, attempt: i32) -> Duration {
        let attempt = attempt.max(1) as u64;
        match &self.backoff {
            Backoff::Schedule(schedule) => {
                if schedule.is_empty() {
                    return Duration::ZERO;
                }
                let idx = ((attempt - 1) as usize).min(schedule.len() - 1);
                Duration::from_secs(schedule[idx])
            }
            Backoff::Exponential {
                base_delay_ms,
                multiplier,
                max_delay_ms,
            } => {
                let factor = multiplier.powi((attempt - 1) as i32);
                let delay_ms = (*base_delay_ms as f64 * factor).min(*max_delay_ms as f64);
                Duration::from_millis(delay_ms as u64)
            }
        }
    }

    /// `next_delay` rounded up to whole seconds, as pgmq visibility
    /// timeouts take integral seconds.
    pub fn next_delay_seconds(&self, attempt: i32) -> i32 {
        let delay = self.next_delay(attempt);
        let secs = delay.as_secs_f64().ceil() as i64;
        secs.clamp(0, i32::MAX as i64) as i32
    }
}
