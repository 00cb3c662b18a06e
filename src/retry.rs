//! Retry policies for durable activity invocation.
//!
//! A policy is evaluated workflow-side: every attempt is recorded in history
//! and the delays between attempts are durable timers, so retry behavior
//! replays deterministically.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::WorkflowError;

/// Backoff and attempt limits for `WorkflowContext::activity_with_retry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub initial_interval_ms: u64,
    /// Multiplier applied per attempt: delay(n) = initial * coeff^(n-1).
    pub backoff_coefficient: f64,
    /// Upper bound on any single delay.
    pub maximum_interval_ms: u64,
    /// Total attempts allowed; 0 means unlimited.
    pub maximum_attempts: u32,
    /// Failure kinds that short-circuit retrying regardless of attempts left.
    pub non_retryable_kinds: Vec<String>,
    /// Per-attempt start-to-close timeout. An attempt that outlives this is
    /// failed with a timeout and retried under the same policy.
    pub start_to_close_timeout_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            backoff_coefficient: 2.0,
            maximum_interval_ms: 100_000,
            maximum_attempts: 0,
            non_retryable_kinds: Vec::new(),
            start_to_close_timeout_ms: None,
        }
    }
}

impl RetryPolicy {
    /// Policy that gives up after the first failure.
    pub fn no_retry() -> Self {
        Self::default().with_maximum_attempts(1)
    }

    /// Fixed-interval policy (backoff coefficient 1.0).
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial_interval_ms: interval.as_millis() as u64,
            backoff_coefficient: 1.0,
            maximum_interval_ms: interval.as_millis() as u64,
            ..Self::default()
        }
    }

    pub fn with_initial_interval(mut self, d: Duration) -> Self {
        self.initial_interval_ms = d.as_millis() as u64;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_maximum_interval(mut self, d: Duration) -> Self {
        self.maximum_interval_ms = d.as_millis() as u64;
        self
    }

    /// 0 means unlimited.
    pub fn with_maximum_attempts(mut self, n: u32) -> Self {
        self.maximum_attempts = n;
        self
    }

    pub fn with_non_retryable(mut self, kind: impl Into<String>) -> Self {
        self.non_retryable_kinds.push(kind.into());
        self
    }

    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.start_to_close_timeout_ms = Some(d.as_millis() as u64);
        self
    }

    /// Delay after the given 1-based attempt fails:
    /// `min(initial * coeff^(attempt-1), maximum)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let raw = (self.initial_interval_ms as f64) * self.backoff_coefficient.powf(exponent as f64);
        let capped = if raw.is_finite() {
            raw.min(self.maximum_interval_ms as f64)
        } else {
            self.maximum_interval_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempt` failed with `error`.
    pub fn permits_retry(&self, error: &WorkflowError, attempt: u32) -> bool {
        if self.maximum_attempts != 0 && attempt >= self.maximum_attempts {
            return false;
        }
        if !error.retryable() {
            return false;
        }
        !self.non_retryable_kinds.iter().any(|k| k == error.kind())
    }
}
