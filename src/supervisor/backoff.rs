//! Reconnect delay schedule
//!
//! Two regimes: a few fast retries doubling from a short base, then slow
//! retries doubling from a longer base up to a cap. Every delay gets a
//! random jitter so a fleet of clients does not reconnect in lockstep.

use std::time::Duration;

use rand::Rng;

use crate::config::StreamConfig;

/// Exponential backoff with two regimes and additive jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Attempts handled by the fast regime (1-based, inclusive)
    pub fast_attempts: u32,
    /// First fast delay in milliseconds
    pub fast_base_ms: u64,
    /// Fast regime ceiling in milliseconds
    pub fast_cap_ms: u64,
    /// First slow delay in milliseconds
    pub slow_base_ms: u64,
    /// Slow regime ceiling in milliseconds
    pub slow_cap_ms: u64,
    /// Exclusive upper bound of the random jitter in milliseconds
    pub max_jitter_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            fast_attempts: 3,
            fast_base_ms: 1_000,
            fast_cap_ms: 8_000,
            slow_base_ms: 2_000,
            slow_cap_ms: 32_000,
            max_jitter_ms: 250,
        }
    }
}

impl From<&StreamConfig> for BackoffPolicy {
    fn from(config: &StreamConfig) -> Self {
        Self {
            fast_attempts: config.fast_retry_attempts,
            fast_base_ms: config.fast_base_ms,
            fast_cap_ms: config.fast_cap_ms,
            slow_base_ms: config.slow_base_ms,
            slow_cap_ms: config.slow_cap_ms,
            max_jitter_ms: config.max_jitter_ms,
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), without jitter.
    ///
    /// ```
    /// use openchamber_sync::supervisor::backoff::BackoffPolicy;
    ///
    /// let policy = BackoffPolicy::default();
    /// assert_eq!(policy.base_delay_ms(1), 1_000);
    /// assert_eq!(policy.base_delay_ms(4), 2_000);
    /// assert_eq!(policy.base_delay_ms(10), 32_000);
    /// ```
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let attempt = attempt.max(1);
        if attempt <= self.fast_attempts {
            doubled(self.fast_base_ms, attempt - 1, self.fast_cap_ms)
        } else {
            doubled(self.slow_base_ms, attempt - self.fast_attempts - 1, self.slow_cap_ms)
        }
    }

    /// Delay for `attempt` with a caller-supplied jitter, clamped to
    /// `[0, max_jitter_ms)`.
    pub fn delay_with_jitter(&self, attempt: u32, jitter_ms: u64) -> Duration {
        let jitter = if self.max_jitter_ms == 0 {
            0
        } else {
            jitter_ms.min(self.max_jitter_ms - 1)
        };
        Duration::from_millis(self.base_delay_ms(attempt) + jitter)
    }

    /// Delay for `attempt` with random jitter
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let jitter = if self.max_jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..self.max_jitter_ms)
        };
        self.delay_with_jitter(attempt, jitter)
    }
}

fn doubled(base: u64, exponent: u32, cap: u64) -> u64 {
    let factor = 1u64.checked_shl(exponent.min(32)).unwrap_or(u64::MAX);
    base.saturating_mul(factor).min(cap)
}
