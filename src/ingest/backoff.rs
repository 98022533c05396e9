//! Bounded exponential backoff for incomplete framing.

use std::time::Duration;

/// Retry limits read at the start of every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Retries allowed before the loop gives up
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(100),
            max_attempts: 8,
        }
    }
}

/// Retry state of one ingestion loop.
///
/// Delays double from `initial_delay` up to `max_delay`. The budget is
/// restored by [`reset`](Backoff::reset) whenever a cycle makes progress.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempts: u32,
    next: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            attempts: 0,
            next: Duration::ZERO,
        }
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self, policy: &RetryPolicy) -> Option<Duration> {
        if self.attempts >= policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        let delay = if self.next.is_zero() {
            policy.initial_delay
        } else {
            self.next
        }
        .min(policy.max_delay);
        self.next = delay.saturating_mul(2).min(policy.max_delay);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next = Duration::ZERO;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
