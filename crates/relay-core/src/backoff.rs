//! Reconnect backoff.
//!
//! The delay for attempt `n` (0-indexed) is `initial × 2^n`, clamped to `max`.
//! It is derived from the attempt number alone, so a run of failures always
//! produces the same schedule.

use std::time::Duration;

/// Default initial delay.
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_millis(1_000);

/// Default delay cap.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_millis(60_000);

/// Exponential backoff with a cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Maximum delay.
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: DEFAULT_BACKOFF_INITIAL,
            max: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl Backoff {
    /// Create a backoff from millisecond settings.
    #[must_use]
    pub fn from_millis(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            initial: Duration::from_millis(initial_ms),
            max: Duration::from_millis(max_ms),
        }
    }

    /// Delay before retry number `attempt`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial.saturating_mul(factor).min(self.max)
    }
}
