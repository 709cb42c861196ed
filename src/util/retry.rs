use std::time::Duration;

use futures_retry::{ErrorHandler, RetryPolicy};
use tracing::warn;

use crate::error::ClusterError;

/// Retries retryable errors up to `max_attempts` times with a fixed delay.
pub(crate) struct FixedCountWithDelayStrategy {
    max_attempts: usize,
    delay: Duration,
}

impl FixedCountWithDelayStrategy {
    pub(crate) fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl ErrorHandler<ClusterError> for FixedCountWithDelayStrategy {
    type OutError = ClusterError;

    fn handle(&mut self, attempt: usize, e: ClusterError) -> RetryPolicy<ClusterError> {
        if attempt >= self.max_attempts || !e.is_retryable() {
            return RetryPolicy::ForwardError(e);
        }

        warn!(attempt, error = %e, delay = ?self.delay, "retrying after failure");
        RetryPolicy::WaitRetry(self.delay)
    }
}

/// Doubling delay between `min` and `max`, reset to `min` after a success.
#[derive(Debug, Clone)]
pub(crate) struct ExponentialBackoff {
    min: Duration,
    max: Duration,
    failures: u32,
}

impl ExponentialBackoff {
    pub(crate) fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            failures: 0,
        }
    }

    /// Delay to wait before the next attempt; each call counts one failure.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.failures.min(31)).unwrap_or(u32::MAX);
        self.failures = self.failures.saturating_add(1);
        self.min.saturating_mul(factor).min(self.max)
    }

    pub(crate) fn reset(&mut self) {
        self.failures = 0;
    }
}
