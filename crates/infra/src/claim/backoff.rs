//! Capped exponential backoff for failed queue rows.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// `delay = min(cap, base * 2^attempts)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(3600),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = cap;
        self
    }

    /// Delay before the next attempt after `attempts` failures so far.
    ///
    /// Overflow of the shift or the multiplication saturates to `cap`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        1u32.checked_shl(attempts)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

/// Outcome of scheduling a retry for one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledRetry {
    /// The attempts counter now stored on the row.
    pub attempts: u32,
    pub delay: Duration,
    pub next_attempt_at: DateTime<Utc>,
}
