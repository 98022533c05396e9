//! Runtime settings read by ingestion loops at the start of every cycle
//!
//! [`RuntimeSettings`] is a plain value; [`SharedSettings`] wraps it in a
//! `parking_lot::RwLock` so an operator (CLI, control surface) can tighten
//! limits or retry budgets while loops are running. A change takes effect
//! at the next cycle boundary, never in the middle of a cycle.

use crate::ingest::backoff::RetryPolicy;
use crate::pipeline::FramingLimits;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// Values an ingestion loop snapshots at cycle start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub limits: FramingLimits,
    pub retry: RetryPolicy,
    /// Bound on one wait for data
    pub wait_timeout: Duration,
    /// Interval between stall reports while waiting on subscribers
    pub stall_threshold: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            limits: FramingLimits::default(),
            retry: RetryPolicy::default(),
            wait_timeout: Duration::from_millis(super::DEFAULT_WAIT_TIMEOUT_MS),
            stall_threshold: Duration::from_secs(1),
        }
    }
}

impl RuntimeSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(mut self, limits: FramingLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }
}

/// Shared, updatable [`RuntimeSettings`]
#[derive(Debug, Clone, Default)]
pub struct SharedSettings(Arc<RwLock<RuntimeSettings>>);

impl SharedSettings {
    pub fn new(settings: RuntimeSettings) -> Self {
        Self(Arc::new(RwLock::new(settings)))
    }

    /// Copy of the current values
    pub fn snapshot(&self) -> RuntimeSettings {
        *self.0.read()
    }

    /// Apply a change, visible from the next cycle on
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut RuntimeSettings),
    {
        let mut settings = self.0.write();
        f(&mut settings);
        tracing::info!(settings = ?*settings, "runtime settings updated");
    }

    pub fn set_max_packet_size(&self, max: u32) {
        self.update(|s| s.limits.max_packet_size = max);
    }

    pub fn set_retry(&self, retry: RetryPolicy) {
        self.update(|s| s.retry = retry);
    }
}

impl From<RuntimeSettings> for SharedSettings {
    fn from(settings: RuntimeSettings) -> Self {
        Self::new(settings)
    }
}
