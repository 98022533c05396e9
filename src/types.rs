//! Core data types for pktflow
//!
//! This module contains the small shared vocabulary used across the crate:
//! source identity, source status, the fault taxonomy, and the telemetry
//! counters that make the ingestion state observable from outside the hot
//! path.
//!
//! # Main Types
//!
//! - [`SourceId`] - Explicit identity of an ingestion source
//! - [`SourceStatus`] - Lifecycle status of an ingestion loop
//! - [`FaultKind`] - Classification of everything that can go wrong
//! - [`RateCounter`] - Bytes-per-second meter, reset on every sample
//! - [`IngestCounters`] - Lock-free counters updated by the ingestion loop
//! - [`IngestStats`] - Serializable point-in-time snapshot for telemetry
//!
//! # Counters
//!
//! Counters are plain atomics with relaxed ordering. They are written by the
//! ingestion thread at cycle end and read by the status thread, so a
//! snapshot may mix values from two adjacent cycles.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

/// Identity of one ingestion source, supplied by whoever constructs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SourceId(pub u32);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "src{}", self.0)
    }
}

/// Lifecycle status of an ingestion loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SourceStatus {
    /// Constructed but not running yet
    #[default]
    Idle,
    /// Moving data
    Running,
    /// Blocked on a subscriber that has not released its batch
    Stalled,
    /// Halted on a fault, needs an external restart
    Faulted,
    /// Stopped on request
    Stopped,
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceStatus::Idle => write!(f, "Idle"),
            SourceStatus::Running => write!(f, "Running"),
            SourceStatus::Stalled => write!(f, "Stalled"),
            SourceStatus::Faulted => write!(f, "Faulted"),
            SourceStatus::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Fault taxonomy
///
/// `Timeout` and `Incomplete` are benign on their own; everything else is
/// either fatal for the ingestion loop or, for `SubscriberStall`, a metric for
/// external alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    /// No data within the wait timeout
    Timeout,
    /// Region ends in a partial packet
    Incomplete,
    /// Incomplete framing persisted past the retry budget
    RetryExhausted,
    /// No valid packet boundary at the start of a region
    CorruptFraming,
    /// Producer outran the consumer and the circular buffer filled up
    BufferFull,
    /// A subscriber held a batch past the stall threshold
    SubscriberStall,
    /// The upstream stream reached end of file / was closed by the peer
    SourceClosed,
    /// I/O error while reading the upstream stream
    Io,
    /// Hardware or driver level fault reported by the source
    SourceFault,
    /// Programming or wiring error inside the process
    Internal,
}

impl FaultKind {
    const ALL: [FaultKind; 10] = [
        FaultKind::Timeout,
        FaultKind::Incomplete,
        FaultKind::RetryExhausted,
        FaultKind::CorruptFraming,
        FaultKind::BufferFull,
        FaultKind::SubscriberStall,
        FaultKind::SourceClosed,
        FaultKind::Io,
        FaultKind::SourceFault,
        FaultKind::Internal,
    ];

    /// Whether the ingestion loop must halt on this fault
    pub fn is_fatal(self) -> bool {
        !matches!(
            self,
            FaultKind::Timeout | FaultKind::Incomplete | FaultKind::SubscriberStall
        )
    }

    fn code(self) -> u8 {
        // 0 is reserved for "no fault recorded"
        Self::ALL.iter().position(|k| *k == self).map_or(0, |i| i as u8 + 1)
    }

    fn from_code(code: u8) -> Option<Self> {
        code.checked_sub(1)
            .and_then(|i| Self::ALL.get(i as usize).copied())
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::Timeout => "timeout",
            FaultKind::Incomplete => "incomplete",
            FaultKind::RetryExhausted => "retry exhausted",
            FaultKind::CorruptFraming => "corrupt framing",
            FaultKind::BufferFull => "buffer full",
            FaultKind::SubscriberStall => "subscriber stall",
            FaultKind::SourceClosed => "source closed",
            FaultKind::Io => "i/o",
            FaultKind::SourceFault => "source fault",
            FaultKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Bytes-per-second meter.
///
/// Every call to [`RateCounter::sample`] returns the average rate since the
/// previous sample and starts a new window.
#[derive(Debug)]
pub struct RateCounter {
    inner: Mutex<RateWindow>,
}

#[derive(Debug)]
struct RateWindow {
    bytes: u64,
    since: Instant,
}

impl RateCounter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RateWindow {
                bytes: 0,
                since: Instant::now(),
            }),
        }
    }

    /// Account `bytes` to the current window.
    pub fn add(&self, bytes: usize) {
        self.inner.lock().bytes += bytes as u64;
    }

    /// Average bytes/s since the last sample; resets the window.
    pub fn sample(&self) -> u64 {
        let now = Instant::now();
        let (bytes, since) = {
            let mut window = self.inner.lock();
            let taken = (window.bytes, window.since);
            window.bytes = 0;
            window.since = now;
            taken
        };
        // Insignificant time, but never divide by zero
        let secs = now.duration_since(since).as_secs_f64().max(1e-6);
        (bytes as f64 / secs) as u64
    }
}

impl Default for RateCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters maintained by one ingestion loop.
#[derive(Debug, Default)]
pub struct IngestCounters {
    packets_received: AtomicU64,
    packets_processed: AtomicU64,
    packets_dropped: AtomicU64,
    bytes_consumed: AtomicU64,
    cycles: AtomicU64,
    retries: AtomicU64,
    stalls: AtomicU64,
    faults: AtomicU64,
    last_fault: AtomicU8,
}

impl IngestCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packets framed into a batch.
    pub fn record_received(&self, packets: usize) {
        self.packets_received
            .fetch_add(packets as u64, Ordering::Relaxed);
    }

    /// A batch fully released by every subscriber.
    pub fn record_processed(&self, packets: usize, bytes: usize) {
        self.packets_processed
            .fetch_add(packets as u64, Ordering::Relaxed);
        self.bytes_consumed.fetch_add(bytes as u64, Ordering::Relaxed);
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Packets that no subscriber accepted.
    pub fn record_dropped(&self, packets: usize) {
        self.packets_dropped
            .fetch_add(packets as u64, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fault(&self, kind: FaultKind) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        self.last_fault.store(kind.code(), Ordering::Relaxed);
    }

    pub fn last_fault(&self) -> Option<FaultKind> {
        FaultKind::from_code(self.last_fault.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_processed: self.packets_processed.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            bytes_consumed: self.bytes_consumed.load(Ordering::Relaxed),
            cycles: self.cycles.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter, including the last fault reason.
    pub fn reset(&self) {
        for counter in [
            &self.packets_received,
            &self.packets_processed,
            &self.packets_dropped,
            &self.bytes_consumed,
            &self.cycles,
            &self.retries,
            &self.stalls,
            &self.faults,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.last_fault.store(0, Ordering::Relaxed);
    }
}

/// Plain copy of [`IngestCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub packets_received: u64,
    pub packets_processed: u64,
    pub packets_dropped: u64,
    pub bytes_consumed: u64,
    pub cycles: u64,
    pub retries: u64,
    pub stalls: u64,
    pub faults: u64,
}

/// Telemetry snapshot of one ingestion source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestStats {
    pub source_id: SourceId,
    pub status: SourceStatus,
    pub counters: CounterSnapshot,
    /// Bytes/s pushed into the buffer since the previous snapshot
    pub push_rate: u64,
    /// Bytes/s consumed from the buffer since the previous snapshot
    pub read_rate: u64,
    pub buffer_used: usize,
    pub buffer_capacity: usize,
    pub last_fault: Option<FaultKind>,
    pub taken_at: DateTime<Utc>,
}

impl IngestStats {
    /// Share of received packets that reached no subscriber, in percent
    pub fn drop_rate(&self) -> f64 {
        if self.counters.packets_received == 0 {
            0.0
        } else {
            self.counters.packets_dropped as f64 / self.counters.packets_received as f64 * 100.0
        }
    }

    /// Buffer fill level in percent
    pub fn buffer_fill(&self) -> f64 {
        if self.buffer_capacity == 0 {
            0.0
        } else {
            self.buffer_used as f64 / self.buffer_capacity as f64 * 100.0
        }
    }
}

/// What a fault handler receives when an ingestion loop halts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultReport {
    pub source_id: SourceId,
    pub kind: FaultKind,
    pub message: String,
    /// Counters flushed right before the loop exited
    pub counters: CounterSnapshot,
    pub at: DateTime<Utc>,
}
