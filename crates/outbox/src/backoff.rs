//! Retry scheduling for records whose publish failed.

use std::time::Duration;

use rand::Rng;

/// Backoff and attempt ceiling applied by `mark_failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failure; doubles with each further failure.
    pub base_delay: Duration,
    /// Ceiling for the exponential delay.
    pub max_delay: Duration,
    /// Failures after which the record is exhausted.
    pub max_attempts: u32,
    /// Spread each delay over `[d/2, d]` so records that failed together
    /// (a broker outage) do not retry together.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Reads `OUTBOX_RETRY_BASE_MS`, `OUTBOX_RETRY_MAX_MS` and
    /// `OUTBOX_MAX_ATTEMPTS`, falling back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_delay: std::env::var("OUTBOX_RETRY_BASE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: std::env::var("OUTBOX_RETRY_MAX_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            max_attempts: std::env::var("OUTBOX_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_attempts),
            jitter: defaults.jitter,
        }
    }

    /// A policy that retries immediately; handy in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts,
            jitter: false,
        }
    }

    /// True once `attempts` failures have used up the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Capped exponential delay after `attempts` failures, before jitter.
    pub fn ceiling_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(32);
        let base_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let delay_ms = base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay_ms).min(self.max_delay)
    }

    /// Delay to wait after `attempts` failures.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let ceiling = self.ceiling_for(attempts);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }
        let ceiling_ms = ceiling.as_millis() as u64;
        let half = ceiling_ms.div_ceil(2);
        let spread = rand::thread_rng().gen_range(0..=ceiling_ms - half);
        Duration::from_millis(half + spread)
    }
}
