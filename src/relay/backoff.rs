//! Reconnection policy.
//!
//! Linear backoff capped at a ceiling: attempt `n` waits
//! `min(base * n, max)`. Once `max_attempts` attempts have been scheduled
//! the policy stops; a manual `connect()` resets the count.

// Rust guideline compliant 2026-02

use std::time::Duration;

use crate::constants::{DEFAULT_BASE_INTERVAL, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_INTERVAL};

/// What to do after a non-user-initiated close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Try again after `delay`.
    Retry {
        /// 1-based attempt number.
        attempt: u32,
        /// Wait before the attempt.
        delay: Duration,
    },
    /// Attempts used up; wait for a manual `connect()`.
    Exhausted {
        /// Attempts that were made.
        attempts: u32,
    },
}

/// Linear capped backoff with a bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Per-attempt increment.
    pub base_interval: Duration,
    /// Delay ceiling.
    pub max_interval: Duration,
    /// Attempts scheduled before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_interval: DEFAULT_BASE_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay for a 1-based attempt number.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_interval
            .saturating_mul(attempt)
            .min(self.max_interval)
    }

    /// Decide for an already-incremented attempt counter.
    pub fn decide(&self, attempt: u32) -> ReconnectDecision {
        if attempt > self.max_attempts {
            ReconnectDecision::Exhausted {
                attempts: attempt.saturating_sub(1),
            }
        } else {
            ReconnectDecision::Retry {
                attempt,
                delay: self.delay_for(attempt),
            }
        }
    }
}
