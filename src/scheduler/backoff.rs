//! Exponential poll backoff.

use std::time::Duration;

/// Delay policy for one tag's poll loop.
///
/// After the n-th consecutive failure the next delay is
/// `min(interval * 2^(n-1), interval * ceiling_factor)`. A success resets the
/// delay to the base interval.
#[derive(Debug, Clone)]
pub struct Backoff {
    interval: Duration,
    ceiling_factor: u32,
    failures: u32,
}

impl Backoff {
    pub fn new(interval: Duration, ceiling_factor: u32) -> Self {
        Self {
            interval,
            ceiling_factor: ceiling_factor.max(1),
            failures: 0,
        }
    }

    /// Record a failure and return the delay before the next attempt.
    pub fn on_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.delay()
    }

    /// Record a success and return the base interval.
    pub fn on_success(&mut self) -> Duration {
        self.failures = 0;
        self.interval
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Delay implied by the current failure count.
    pub fn delay(&self) -> Duration {
        if self.failures == 0 {
            return self.interval;
        }
        let multiplier = 1u32
            .checked_shl(self.failures - 1)
            .unwrap_or(u32::MAX)
            .min(self.ceiling_factor);
        self.interval.saturating_mul(multiplier)
    }
}
