//! Provider rate-limit state.
//!
//! One tracker lives inside each collector's [`RetryPolicy`](super::retry::RetryPolicy),
//! so every account on a platform shares the provider's real budget.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Added to every reset wait so we never call back in the same second the
/// window reopens.
pub const RESET_SAFETY_BUFFER: Duration = Duration::from_millis(1_000);

/// Snapshot of a provider's call budget, as reported by its response headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub remaining: u32,
    pub limit: u32,
    pub reset_at: DateTime<Utc>,
    pub is_limited: bool,
}

impl RateLimitStatus {
    pub fn new(remaining: u32, limit: u32, reset_at: DateTime<Utc>) -> Self {
        Self {
            remaining,
            limit,
            reset_at,
            is_limited: remaining == 0,
        }
    }

    /// Limited *and* the window has not yet reset. A stale `is_limited` flag
    /// from a past window does not block.
    pub fn is_blocking_at(&self, now: DateTime<Utc>) -> bool {
        self.is_limited && now < self.reset_at
    }

    pub fn time_until_reset_at(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Default)]
pub struct RateLimitTracker {
    status: Mutex<Option<RateLimitStatus>>,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest budget. `reset_epoch_secs` is a Unix timestamp.
    pub fn update(&self, remaining: u32, limit: u32, reset_epoch_secs: i64) {
        let reset_at = DateTime::from_timestamp(reset_epoch_secs, 0).unwrap_or_else(Utc::now);
        self.set(RateLimitStatus::new(remaining, limit, reset_at));
    }

    pub fn set(&self, status: RateLimitStatus) {
        tracing::debug!(
            remaining = status.remaining,
            limit = status.limit,
            reset_at = %status.reset_at,
            "rate limit updated"
        );
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = Some(status);
    }

    pub fn status(&self) -> Option<RateLimitStatus> {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_rate_limited(&self) -> bool {
        self.is_rate_limited_at(Utc::now())
    }

    pub fn is_rate_limited_at(&self, now: DateTime<Utc>) -> bool {
        self.status()
            .is_some_and(|status| status.is_blocking_at(now))
    }

    pub fn time_until_reset(&self) -> Duration {
        self.time_until_reset_at(Utc::now())
    }

    pub fn time_until_reset_at(&self, now: DateTime<Utc>) -> Duration {
        self.status()
            .map_or(Duration::ZERO, |status| status.time_until_reset_at(now))
    }

    /// Sleep until the window resets, plus [`RESET_SAFETY_BUFFER`].
    pub async fn wait_for_reset(&self) {
        let wait = self.time_until_reset() + RESET_SAFETY_BUFFER;
        tracing::info!(wait_ms = wait.as_millis() as u64, "waiting for rate limit reset");
        tokio::time::sleep(wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn fresh_tracker_is_not_limited() {
        let tracker = RateLimitTracker::new();
        assert!(tracker.status().is_none());
        assert!(!tracker.is_rate_limited());
        assert_eq!(tracker.time_until_reset(), Duration::ZERO);
    }

    #[test]
    fn exhausted_budget_blocks_until_reset() {
        let tracker = RateLimitTracker::new();
        let reset = Utc::now() + TimeDelta::seconds(30);
        tracker.update(0, 100, reset.timestamp());

        let status = tracker.status().unwrap();
        assert!(status.is_limited);
        assert_eq!(status.limit, 100);
        assert!(tracker.is_rate_limited());
        assert!(tracker.time_until_reset() > Duration::from_secs(25));
    }

    #[test]
    fn stale_limit_does_not_block() {
        let tracker = RateLimitTracker::new();
        let reset = Utc::now() - TimeDelta::seconds(5);
        tracker.update(0, 100, reset.timestamp());

        assert!(tracker.status().unwrap().is_limited);
        assert!(!tracker.is_rate_limited());
        assert_eq!(tracker.time_until_reset(), Duration::ZERO);
    }

    #[test]
    fn reset_instant_itself_is_not_blocking() {
        let tracker = RateLimitTracker::new();
        let reset = Utc::now() + TimeDelta::seconds(10);
        tracker.update(0, 10, reset.timestamp());
        let at_reset = DateTime::from_timestamp(reset.timestamp(), 0).unwrap();

        assert!(tracker.is_rate_limited_at(at_reset - TimeDelta::milliseconds(1)));
        assert!(!tracker.is_rate_limited_at(at_reset));
    }

    #[test]
    fn remaining_budget_never_blocks() {
        let tracker = RateLimitTracker::new();
        tracker.update(5, 100, (Utc::now() + TimeDelta::seconds(60)).timestamp());
        assert!(!tracker.status().unwrap().is_limited);
        assert!(!tracker.is_rate_limited());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_reset_sleeps_past_the_window() {
        let tracker = RateLimitTracker::new();
        tracker.update(0, 10, (Utc::now() + TimeDelta::seconds(3)).timestamp());

        let started = tokio::time::Instant::now();
        tracker.wait_for_reset().await;
        let waited = started.elapsed();

        assert!(waited >= RESET_SAFETY_BUFFER + Duration::from_secs(1));
        assert!(waited <= RESET_SAFETY_BUFFER + Duration::from_secs(3));
    }
}
