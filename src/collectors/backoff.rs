//! Exponential backoff with jitter.
//!
//! Many accounts hit the same provider at once; the ±10% jitter keeps their
//! retries from lining up into synchronized storms.

use std::time::Duration;

use rand::Rng;

/// Fraction of the capped delay applied as symmetric jitter.
const JITTER_RATIO: f64 = 0.1;

/// Retry schedule for one collector. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(60_000),
            multiplier: 2.0,
            max_retries: 3,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (0-based).
    ///
    /// | Attempt | Delay (defaults)         |
    /// |---------|--------------------------|
    /// | 0       | 1 000 ms ± 10 %          |
    /// | 1       | 2 000 ms ± 10 %          |
    /// | 2       | 4 000 ms ± 10 %          |
    /// | n       | min(1 000 × 2ⁿ, 60 000) ± 10 % |
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = rand::rng().random_range(-JITTER_RATIO..=JITTER_RATIO);
        self.delay_with_jitter(attempt, jitter)
    }

    /// `jitter` is a fraction in `[-0.1, 0.1]` of the capped delay.
    fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let capped = self.capped_delay_ms(attempt);
        let delay_ms = (capped + capped * jitter).max(0.0);
        Duration::from_secs_f64(delay_ms / 1_000.0)
    }

    /// `min(initial × multiplier^attempt, max)` in milliseconds, before jitter.
    pub fn capped_delay_ms(&self, attempt: u32) -> f64 {
        let initial = self.initial_delay.as_secs_f64() * 1_000.0;
        let max = self.max_delay.as_secs_f64() * 1_000.0;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let computed = initial * self.multiplier.powi(exponent);
        if computed.is_nan() {
            // 0 × ∞ once the exponent overflows with a zero initial delay
            return 0.0;
        }
        computed.min(max).max(0.0)
    }
}
