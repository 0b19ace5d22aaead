//! Rate-limit-aware retry executor shared by every platform collector.
//!
//! [`RetryPolicy::execute`] wraps a fallible async operation:
//!
//! - If the tracker says the provider budget is exhausted, wait for the reset
//!   before calling out.
//! - [`ErrorKind::RateLimit`] failures wait for the reset and retry, up to
//!   `max_retries`, then fail with [`CollectError::RateLimitExhausted`].
//! - [`ErrorKind::Transient`] failures sleep for the jittered backoff delay and
//!   retry, up to `max_retries`, then return the original error.
//! - [`ErrorKind::Permanent`] failures are returned immediately.

use std::future::Future;

use crate::collectors::backoff::BackoffConfig;
use crate::collectors::rate_limit::{RateLimitStatus, RateLimitTracker};
use crate::error::{CollectError, ErrorKind};

/// Backoff schedule plus the rate-limit state it reacts to. Each concrete
/// collector owns exactly one.
#[derive(Debug, Default)]
pub struct RetryPolicy {
    backoff: BackoffConfig,
    tracker: RateLimitTracker,
}

impl RetryPolicy {
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            backoff,
            tracker: RateLimitTracker::new(),
        }
    }

    pub fn backoff(&self) -> &BackoffConfig {
        &self.backoff
    }

    pub fn tracker(&self) -> &RateLimitTracker {
        &self.tracker
    }

    pub fn rate_limit_status(&self) -> Option<RateLimitStatus> {
        self.tracker.status()
    }

    /// With `max_retries = 3` the operation runs at most 4 times.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, CollectError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CollectError>>,
    {
        let max_retries = self.backoff.max_retries;
        let mut attempt = 0u32;

        loop {
            if self.tracker.is_rate_limited() {
                self.tracker.wait_for_reset().await;
            }

            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match err.kind() {
                ErrorKind::RateLimit => {
                    if attempt >= max_retries {
                        tracing::error!(max_retries, error = %err, "rate limit retries exhausted");
                        return Err(CollectError::RateLimitExhausted {
                            retries: max_retries,
                        });
                    }
                    tracing::warn!(
                        attempt,
                        max_retries,
                        error = %err,
                        "rate limited, waiting for reset before retrying"
                    );
                    self.tracker.wait_for_reset().await;
                }
                ErrorKind::Transient => {
                    if attempt >= max_retries {
                        return Err(err);
                    }
                    let delay = self.backoff.delay(attempt);
                    tracing::warn!(
                        attempt,
                        max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient error, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
                ErrorKind::Permanent => return Err(err),
            }

            attempt += 1;
        }
    }
}
