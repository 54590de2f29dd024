//! Retry decisions with exponential backoff and jitter.

use std::time::Duration;

use rand::Rng;

use crate::error::{FailureClass, FailureKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt (so `max_retries + 1` attempts total).
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
    /// Upper bound of the random multiplier added on top of the base delay,
    /// in `[0, 1]`.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            jitter_factor: 0.5,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_retries,
            base,
            cap,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// Decide what to do after `attempt` (1-based) failed with `kind`.
    ///
    /// Only transient failures are retried, and only while
    /// `attempt <= max_retries`.
    pub fn should_retry(&self, attempt: u32, kind: FailureKind) -> RetryDecision {
        if kind.class() != FailureClass::Transient || attempt > self.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay_with(attempt, rand::thread_rng().r#gen::<f64>()))
    }

    /// Backoff for `attempt` with the random draw fixed to `unit` in `[0, 1)`.
    ///
    /// `base * 2^(attempt-1) * (1 + jitter_factor * unit)`, capped.
    pub fn delay_with(&self, attempt: u32, unit: f64) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.base.as_secs_f64() * 2f64.powi(exp);
        let jittered = scaled * (1.0 + self.jitter_factor * unit.clamp(0.0, 1.0));
        let capped = jittered.min(self.cap.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.cap)
    }

    /// Total attempts the dispatcher may make.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}
