//! CircularBuffer: bounded FIFO between a producer and one ingestion loop.
//!
//! The producer appends into a growable `BytesMut`; the consumer gets
//! immutable `Bytes` views. Handing out a region is zero-copy in the common
//! case where the previous region was fully consumed. Only when a partial
//! packet is left over is that short tail copied in front of the new bytes,
//! so every region the consumer sees is contiguous.
//!
//! ```text
//!  producer ─push─► pending (BytesMut) ──wait──► ready (Bytes) ─► consumer
//!                                                 └─ consume(len) advances
//! ```
//!
//! `used = ready.len() + pending.len()` never exceeds `capacity`. A full
//! buffer makes `push` return a short count; the producer decides whether
//! that is fatal.
//!
//! Faults are latched by the producing side and returned by the next wait.
//! `SourceClosed` is the exception: it is only reported once the remaining
//! bytes have been consumed.

use crate::error::{FlowError, Result};
use crate::ingest::source::{RawSource, WaitOutcome};
use crate::pipeline::RawBuffer;
use crate::types::{FaultKind, RateCounter};
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct BufferState {
    /// Pushed, not yet handed out
    pending: BytesMut,
    /// Handed out, not yet consumed
    ready: Bytes,
    /// Length of the region returned by the last wait, minus consumed bytes
    handed: usize,
    fault: Option<(FaultKind, String)>,
}

impl BufferState {
    fn used(&self) -> usize {
        self.ready.len() + self.pending.len()
    }

    /// Move pending bytes behind the unconsumed tail and return the region.
    fn region(&mut self) -> RawBuffer {
        if !self.pending.is_empty() {
            if self.ready.is_empty() {
                self.ready = self.pending.split().freeze();
            } else {
                let mut merged = BytesMut::with_capacity(self.ready.len() + self.pending.len());
                merged.extend_from_slice(&self.ready);
                merged.extend_from_slice(&self.pending);
                self.pending.clear();
                self.ready = merged.freeze();
            }
        }
        self.handed = self.ready.len();
        RawBuffer::new(self.ready.clone())
    }

    /// A closed upstream still lets the consumer drain what arrived before
    /// the close. Every other fault surfaces immediately.
    fn check_fault(&self) -> Result<()> {
        match &self.fault {
            Some((FaultKind::SourceClosed, _)) if self.used() > 0 => Ok(()),
            Some((kind, message)) => Err(FlowError::source_fault(*kind, message.clone())),
            None => Ok(()),
        }
    }
}

/// Bounded single-consumer byte FIFO.
pub struct CircularBuffer {
    state: Mutex<BufferState>,
    data_ready: Condvar,
    space_ready: Condvar,
    capacity: usize,
    push_rate: RateCounter,
    read_rate: RateCounter,
}

impl CircularBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(BufferState {
                pending: BytesMut::with_capacity(capacity),
                ready: Bytes::new(),
                handed: 0,
                fault: None,
            }),
            data_ready: Condvar::new(),
            space_ready: Condvar::new(),
            capacity,
            push_rate: RateCounter::new(),
            read_rate: RateCounter::new(),
        }
    }

    /// Append as much of `data` as fits. Returns the number of bytes
    /// written, which is short (possibly 0) when the buffer is full or
    /// faulted.
    pub fn push(&self, data: &[u8]) -> usize {
        let written = {
            let mut state = self.state.lock();
            if state.fault.is_some() {
                return 0;
            }
            let room = self.capacity.saturating_sub(state.used());
            let n = room.min(data.len());
            state.pending.extend_from_slice(&data[..n]);
            n
        };
        if written > 0 {
            self.push_rate.add(written);
            self.data_ready.notify_all();
        }
        written
    }

    /// Block until at least `min` bytes of room exist, or `timeout`.
    pub fn wait_for_space(&self, min: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if self.capacity.saturating_sub(state.used()) >= min {
                return true;
            }
            if state.fault.is_some() {
                return false;
            }
            if self.space_ready.wait_until(&mut state, deadline).timed_out() {
                return self.capacity.saturating_sub(state.used()) >= min;
            }
        }
    }

    /// Latch a fault reported by the producing side. Keeps the first one.
    pub fn fault(&self, kind: FaultKind, message: impl Into<String>) {
        let mut state = self.state.lock();
        if state.fault.is_none() {
            let message = message.into();
            tracing::error!(%kind, %message, "buffer fault latched");
            state.fault = Some((kind, message));
        }
        drop(state);
        self.data_ready.notify_all();
        self.space_ready.notify_all();
    }

    pub fn fault_kind(&self) -> Option<FaultKind> {
        self.state.lock().fault.as_ref().map(|(kind, _)| *kind)
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().used() == 0
    }

    /// Wait until `ready(state)` holds, a fault is latched, or `deadline`.
    /// Returns the guard and whether the predicate held.
    fn wait_until<F>(&self, deadline: Instant, ready: F) -> (MutexGuard<'_, BufferState>, bool)
    where
        F: Fn(&BufferState) -> bool,
    {
        let mut state = self.state.lock();
        loop {
            if state.fault.is_some() || ready(&state) {
                return (state, true);
            }
            if self.data_ready.wait_until(&mut state, deadline).timed_out() {
                let held = ready(&state);
                return (state, held);
            }
        }
    }
}

impl RawSource for CircularBuffer {
    fn wait(&self, timeout: Duration) -> Result<WaitOutcome> {
        let (mut state, ready) = self.wait_until(Instant::now() + timeout, |s| s.used() > 0);
        state.check_fault()?;
        if !ready {
            return Ok(WaitOutcome::Timeout);
        }
        Ok(WaitOutcome::Ready(state.region()))
    }

    fn wait_more(&self, seen: usize, timeout: Duration) -> Result<WaitOutcome> {
        let (mut state, _) = self.wait_until(Instant::now() + timeout, |s| s.used() > seen);
        state.check_fault()?;
        if state.used() == 0 {
            return Ok(WaitOutcome::Timeout);
        }
        Ok(WaitOutcome::Ready(state.region()))
    }

    fn consume(&self, len: usize) -> Result<()> {
        {
            let mut state = self.state.lock();
            if len > state.handed {
                return Err(FlowError::ConsumeOverrun {
                    requested: len,
                    available: state.handed,
                });
            }
            state.ready.advance(len);
            state.handed -= len;
        }
        self.read_rate.add(len);
        self.space_ready.notify_all();
        Ok(())
    }

    fn clear(&self) {
        {
            let mut state = self.state.lock();
            state.pending.clear();
            state.ready = Bytes::new();
            state.handed = 0;
            state.fault = None;
        }
        tracing::info!("buffer cleared");
        self.space_ready.notify_all();
    }

    fn used(&self) -> usize {
        self.state.lock().used()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn push_rate(&self) -> u64 {
        self.push_rate.sample()
    }

    fn read_rate(&self) -> u64 {
        self.read_rate.sample()
    }
}
