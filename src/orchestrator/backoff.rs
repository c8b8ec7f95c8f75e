//! Retry backoff: deterministic, exponential, capped.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::BackoffConfig;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
    multiplier: u32,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            initial: config.initial,
            max: config.max.max(config.initial),
            multiplier: config.multiplier.max(1),
        }
    }

    /// Delay after the `failed_attempt`-th failure (1-based):
    /// `min(initial * multiplier^(n-1), max)`.
    pub fn delay(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1);
        match self.multiplier.checked_pow(exponent) {
            Some(factor) => self.initial.saturating_mul(factor).min(self.max),
            None => self.max,
        }
    }

    pub fn next_retry(&self, failed_attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.delay(failed_attempt))
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
