//! Exponential backoff helpers.

use std::time::Duration;

/// Delay schedule between retries of a failed task.
///
/// Retry `n` (1-based) waits `base * 2^(n-1)`, capped at `max`: the first
/// retry waits `base`, each later one doubles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// No delay between attempts.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base_ms = self.base.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(exponent));
        Duration::from_millis(delay_ms).min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
    }
}

/// Growing sleep between empty polls, reset as soon as work shows up.
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl IdleBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            current: min,
        }
    }

    /// Delay to sleep now; doubles the next one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Backoff after consecutive broker errors: 2^n seconds, capped at 30s.
pub fn error_backoff(consecutive_errors: u32) -> Duration {
    Duration::from_secs(2u64.pow(consecutive_errors.min(5)).min(30))
}
