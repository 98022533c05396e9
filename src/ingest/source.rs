//! RawSource: the byte provider an ingestion loop drains.

use crate::error::Result;
use crate::pipeline::RawBuffer;
use std::time::Duration;

/// Result of a wait for data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Contiguous view of every unconsumed byte
    Ready(RawBuffer),
    /// Nothing arrived in time; benign
    Timeout,
}

impl WaitOutcome {
    pub fn is_timeout(&self) -> bool {
        matches!(self, WaitOutcome::Timeout)
    }
}

/// A bounded byte source with an explicit consume step.
///
/// Consumers call [`wait`](RawSource::wait), frame what they got, and then
/// [`consume`](RawSource::consume) exactly the bytes that belonged to
/// accepted packets. Unconsumed bytes are handed out again by the next wait.
pub trait RawSource: Send + Sync {
    /// Block until data is available, `timeout` elapses or the source
    /// faults.
    fn wait(&self, timeout: Duration) -> Result<WaitOutcome>;

    /// Like [`wait`](RawSource::wait), but only counts data beyond the
    /// `seen` bytes already handed out as new. Returns the current region
    /// once more data arrived or `timeout` elapsed.
    fn wait_more(&self, seen: usize, timeout: Duration) -> Result<WaitOutcome> {
        let _ = seen;
        std::thread::sleep(timeout);
        self.wait(Duration::ZERO)
    }

    /// Drop `len` bytes from the front. `len` must not exceed the region
    /// returned by the last wait.
    fn consume(&self, len: usize) -> Result<()>;

    /// Drop everything and clear a latched fault.
    fn clear(&self);

    fn used(&self) -> usize;

    fn capacity(&self) -> usize;

    /// Bytes/s written since the previous call.
    fn push_rate(&self) -> u64 {
        0
    }

    /// Bytes/s consumed since the previous call.
    fn read_rate(&self) -> u64 {
        0
    }
}
