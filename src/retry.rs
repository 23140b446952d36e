use std::{future::Future, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::FailureReason;

/// Attempt budget and exponential backoff for one tile or object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for every further retry.
    pub base_delay: Duration,
    /// Extra factor applied when the provider signalled throttling.
    pub throttle_factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            throttle_factor: 2,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// `base * 2^retry`, 0-indexed: 0.5s, 1s, 2s with the defaults.
    pub fn delay(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(2_u32.saturating_pow(retry))
    }

    /// Delay before retry number `retry` after `failure`.
    ///
    /// Throttling waits longer: the provider's `Retry-After` if it sent one,
    /// but never less than the plain backoff times the throttle factor.
    pub fn delay_after(&self, failure: &FailureReason, retry: u32) -> Duration {
        let plain = self.delay(retry);
        match failure {
            FailureReason::Throttled { retry_after_ms } => {
                let extended = plain.saturating_mul(self.throttle_factor.max(1));
                retry_after_ms
                    .map(Duration::from_millis)
                    .map_or(extended, |after| after.max(extended))
            }
            _ => plain,
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retriable reason, or the
    /// attempt budget is spent. Returns the last result and the number of
    /// attempts made.
    ///
    /// Cancellation is checked before every attempt and cuts a backoff sleep
    /// short.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> (Result<T, FailureReason>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FailureReason>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return (Err(FailureReason::Cancelled), attempt);
            }

            attempt += 1;
            let failure = match op(attempt).await {
                Ok(value) => return (Ok(value), attempt),
                Err(failure) => failure,
            };

            if !failure.is_retriable() || attempt >= max_attempts {
                return (Err(failure), attempt);
            }

            let delay = self.delay_after(&failure, attempt - 1);
            debug!(attempt, ?delay, reason = %failure, "retrying after backoff");

            tokio::select! {
                _ = cancel.cancelled() => return (Err(FailureReason::Cancelled), attempt),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
