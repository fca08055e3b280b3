//! Retry backoff policy.

use std::time::Duration;

/// Exponential backoff for failed jobs.
///
/// Pure and deterministic so it is independently testable: the delay depends
/// only on the attempt count and the two bounds.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt.
    pub base_delay: Duration,

    /// Ceiling on the computed delay.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    /// Base 5s, capped at 5 minutes.
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// `delay(n) = min(base_delay * 2^(n-1), max_delay)`.
    ///
    /// `attempts` is the job's attempt count at failure time. Values below 1
    /// are clamped to 1, so the first retry always waits the full base delay
    /// and the exponent can never go negative.
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.max(1) - 1;
        // 2^31 already dwarfs any sane max_delay; clamping keeps the shift in range.
        let factor = 1u32 << exponent.min(31);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
