//! Per-entry retry policy.
//!
//! Both sync directions share one policy: a failed delivery is deferred with
//! exponential backoff and, after `max_attempts` failures, parked as a dead
//! letter that only a manual requeue brings back.

use std::time::Duration;

/// What to do with an entry after a failed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Keep the entry; it becomes eligible again at this time (Unix ms).
    RetryAt(i64),
    /// Stop offering the entry.
    DeadLetter,
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Failures after which an entry is dead-lettered.
    /// `u32::MAX` retries forever.
    pub max_attempts: u32,

    /// Delay after the first failure.
    pub initial_delay: Duration,

    /// Ceiling for the exponential backoff.
    pub max_delay: Duration,

    /// Backoff multiplier (2.0 doubles the delay after each failure).
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Retry immediately and forever. Matches the behaviour of leaving a
    /// failed entry at the head of the queue.
    pub fn unbounded_immediate() -> Self {
        Self {
            max_attempts: u32::MAX,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
        }
    }

    /// Backoff delay after the `attempts`-th failure (1-based).
    pub fn delay_for(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let exp = (attempts - 1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else if capped > 0.0 {
            self.max_delay
        } else {
            Duration::ZERO
        }
    }

    /// Decide the fate of an entry that has now failed `attempts` times.
    pub fn on_failure(&self, attempts: u32, now: i64) -> FailureDisposition {
        if attempts >= self.max_attempts {
            FailureDisposition::DeadLetter
        } else {
            FailureDisposition::RetryAt(now + self.delay_for(attempts).as_millis() as i64)
        }
    }
}
