//! Retry policy with capped exponential backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-handler retry behaviour.
///
/// Also the `reliability` configuration section, where it supplies the
/// default policy for handlers registered without one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = dead-letter on first failure).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Fail straight to the dead-letter queue.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry_count + 1`.
    ///
    /// `min(initial × multiplier^retry_count, max)`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(retry_count.min(i32::MAX as u32) as i32);
        let delay_ms = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);

        // NaN or negative multipliers collapse to the initial delay.
        if delay_ms.is_finite() && delay_ms >= 0.0 {
            Duration::from_millis(delay_ms as u64)
        } else {
            Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms))
        }
    }

    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}
