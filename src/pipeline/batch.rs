//! PacketBatch: reference-counted, zero-copy batch of validated packets.
//!
//! A batch is owned by one producer (an ingestion loop or a transform node)
//! and reused cycle after cycle. Between `reset` and the moment the refcount
//! drops back to zero its content is immutable and may be read from any
//! number of threads at once.
//!
//! # Lifecycle
//!
//! ```text
//! reset(raw) ─► refcount = 1 (owner)
//!    │
//!    ├─► reserve() per subscriber ─► release() when each one is done
//!    │
//!    └─► owner release() ─► wait_all_released() ─► reset(next raw)
//! ```
//!
//! `reset` refuses while any reference is outstanding, which is what keeps
//! the raw region alive and unchanged for every reader.

use crate::error::{FlowError, Result};
use crate::pipeline::framer::{FrameOutcome, Framer, FramingLimits};
use crate::pipeline::packet::{Packet, PacketKind, RawBuffer};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What a successful `reset` produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameSummary {
    /// Number of accepted packets
    pub packets: usize,
    /// Bytes belonging to accepted packets; the only bytes that may be consumed
    pub consumed: usize,
    /// Region ended in bytes that did not form an accepted packet
    pub incomplete: bool,
}

#[derive(Default)]
struct BatchContent {
    packets: Arc<[Packet]>,
    raw: RawBuffer,
}

/// Reusable, refcounted batch of packet views.
pub struct PacketBatch {
    content: RwLock<BatchContent>,
    refcount: AtomicUsize,
    gate: Mutex<()>,
    released: Condvar,
}

impl Default for PacketBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketBatch {
    pub fn new() -> Self {
        Self {
            content: RwLock::new(BatchContent {
                packets: Arc::from(Vec::new()),
                raw: RawBuffer::default(),
            }),
            refcount: AtomicUsize::new(0),
            gate: Mutex::new(()),
            released: Condvar::new(),
        }
    }

    // ── Writers (owner only, refcount must be zero) ──

    /// Frame `raw` into this batch.
    ///
    /// On success the batch holds the accepted packets and the owner holds
    /// the single reference. On corrupt framing the batch is left empty
    /// with no references and the error is returned.
    pub fn reset(&self, raw: RawBuffer, limits: &FramingLimits) -> Result<FrameSummary> {
        let mut content = self.content.write();
        self.ensure_idle()?;

        let outcome = match Framer::new(*limits).frame(&raw) {
            Ok(outcome) => outcome,
            Err(err) => {
                *content = BatchContent::default();
                return Err(FlowError::from(err));
            }
        };

        let FrameOutcome {
            packets,
            consumed,
            incomplete,
        } = outcome;
        let summary = FrameSummary {
            packets: packets.len(),
            consumed,
            incomplete,
        };
        content.packets = Arc::from(packets);
        content.raw = raw;
        self.refcount.store(1, Ordering::Release);
        Ok(summary)
    }

    /// Hold a single already-validated packet.
    pub fn reset_packet(&self, packet: Packet) -> Result<()> {
        let raw = RawBuffer::new(packet.to_bytes());
        self.install(Arc::from(vec![packet]), raw)
    }

    /// Alias every packet of `other` without copying.
    pub fn reset_from(&self, other: &PacketBatch) -> Result<()> {
        let (packets, raw) = {
            let src = other.content.read();
            (Arc::clone(&src.packets), src.raw.clone())
        };
        self.install(packets, raw)
    }

    /// Alias the packets of `other` that pass `keep`, in order.
    pub fn reset_subset<F>(&self, other: &PacketBatch, keep: F) -> Result<()>
    where
        F: Fn(&Packet) -> bool,
    {
        let (packets, raw) = {
            let src = other.content.read();
            let kept: Vec<Packet> = src.packets.iter().filter(|p| keep(p)).cloned().collect();
            (Arc::from(kept), src.raw.clone())
        };
        self.install(packets, raw)
    }

    /// Install pre-built packets that live inside `raw`.
    pub fn reset_packets(&self, packets: Vec<Packet>, raw: RawBuffer) -> Result<()> {
        self.install(Arc::from(packets), raw)
    }

    fn install(&self, packets: Arc<[Packet]>, raw: RawBuffer) -> Result<()> {
        let mut content = self.content.write();
        self.ensure_idle()?;
        content.packets = packets;
        content.raw = raw;
        self.refcount.store(1, Ordering::Release);
        Ok(())
    }

    fn ensure_idle(&self) -> Result<()> {
        match self.refcount.load(Ordering::Acquire) {
            0 => Ok(()),
            refcount => Err(FlowError::BatchBusy { refcount }),
        }
    }

    // ── Reference counting ──

    /// Add one reference for an additional concurrent consumer.
    ///
    /// # Panics
    /// If the batch holds no references (empty or already released).
    pub fn reserve(&self) {
        let prev = self
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                if c == 0 {
                    None
                } else {
                    Some(c + 1)
                }
            });
        assert!(prev.is_ok(), "reserve() on a batch with no references");
    }

    /// Drop one reference, waking waiters when the last one goes.
    ///
    /// # Panics
    /// On release without a matching reference.
    pub fn release(&self) {
        let prev = self
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
        match prev {
            Ok(1) => {
                // Notify under the gate so a waiter between its check and
                // its wait cannot miss the wakeup.
                let _gate = self.gate.lock();
                self.released.notify_all();
            }
            Ok(_) => {}
            Err(_) => panic!("release() without a matching reserve()"),
        }
    }

    /// Block until every reference has been released.
    pub fn wait_all_released(&self) {
        let mut gate = self.gate.lock();
        while self.refcount.load(Ordering::Acquire) != 0 {
            self.released.wait(&mut gate);
        }
    }

    /// Bounded variant of [`wait_all_released`](Self::wait_all_released).
    /// Returns `true` once the count reached zero, `false` on timeout.
    pub fn wait_all_released_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut gate = self.gate.lock();
        while self.refcount.load(Ordering::Acquire) != 0 {
            if self.released.wait_until(&mut gate, deadline).timed_out() {
                return self.refcount.load(Ordering::Acquire) == 0;
            }
        }
        true
    }

    /// Reserve a reference that is released when the lease drops.
    pub fn lease(self: &Arc<Self>) -> BatchLease {
        self.reserve();
        BatchLease {
            batch: Arc::clone(self),
        }
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    // ── Readers ──

    /// Shared handle to the packet sequence.
    pub fn packets(&self) -> Arc<[Packet]> {
        Arc::clone(&self.content.read().packets)
    }

    pub fn len(&self) -> usize {
        self.content.read().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The raw region the packets are views into.
    pub fn raw(&self) -> RawBuffer {
        self.content.read().raw.clone()
    }

    /// Total wire bytes of the held packets.
    pub fn byte_len(&self) -> usize {
        self.content.read().packets.iter().map(Packet::len).sum()
    }

    /// Distinct kinds present, in first-seen order.
    pub fn kinds(&self) -> Vec<PacketKind> {
        let content = self.content.read();
        let mut kinds: Vec<PacketKind> = Vec::new();
        for packet in content.packets.iter() {
            if !kinds.contains(&packet.kind()) {
                kinds.push(packet.kind());
            }
        }
        kinds
    }
}

impl std::fmt::Debug for PacketBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBatch")
            .field("packets", &self.len())
            .field("refcount", &self.refcount())
            .finish()
    }
}

/// RAII reference to a batch.
pub struct BatchLease {
    batch: Arc<PacketBatch>,
}

impl BatchLease {
    /// Take ownership of a reference that was already reserved.
    pub fn adopt(batch: Arc<PacketBatch>) -> Self {
        Self { batch }
    }

    pub fn batch(&self) -> &Arc<PacketBatch> {
        &self.batch
    }
}

impl std::ops::Deref for BatchLease {
    type Target = PacketBatch;

    fn deref(&self) -> &PacketBatch {
        &self.batch
    }
}

impl Drop for BatchLease {
    fn drop(&mut self) {
        self.batch.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::packet::{write_packet, PacketHeader, HEADER_SIZE};
    use bytes::BytesMut;
    use proptest::prelude::*;
    use std::thread;

    fn raw(lengths: &[usize]) -> RawBuffer {
        let mut buf = BytesMut::new();
        for (i, len) in lengths.iter().enumerate() {
            let header = PacketHeader::new(PacketKind(i as u16 % 2 + 1), 0).with_sequence(i as u32);
            write_packet(&mut buf, header, &vec![i as u8; len - HEADER_SIZE]);
        }
        RawBuffer::new(buf.freeze())
    }

    #[test]
    fn test_reset_frames_and_owns() {
        let batch = PacketBatch::new();
        let summary = batch.reset(raw(&[24, 40, 16]), &FramingLimits::default()).unwrap();
        assert_eq!(summary.packets, 3);
        assert_eq!(summary.consumed, 80);
        assert!(!summary.incomplete);
        assert_eq!(batch.refcount(), 1);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.byte_len(), 80);
        assert_eq!(batch.kinds(), vec![PacketKind(1), PacketKind(2)]);
    }

    #[test]
    fn test_reset_refused_while_referenced() {
        let batch = PacketBatch::new();
        batch.reset(raw(&[24]), &FramingLimits::default()).unwrap();
        let err = batch.reset(raw(&[16]), &FramingLimits::default()).unwrap_err();
        assert!(matches!(err, FlowError::BatchBusy { refcount: 1 }));
        assert_eq!(batch.len(), 1);

        batch.release();
        assert!(batch.reset(raw(&[16]), &FramingLimits::default()).is_ok());
    }

    #[test]
    fn test_corrupt_reset_leaves_empty() {
        let batch = PacketBatch::new();
        batch.reset(raw(&[24]), &FramingLimits::default()).unwrap();
        batch.release();

        let limits = FramingLimits::default().with_max_packet_size(32);
        let err = batch.reset(raw(&[64]), &limits).unwrap_err();
        assert!(matches!(err, FlowError::CorruptFraming(_)));
        assert!(batch.is_empty());
        assert_eq!(batch.refcount(), 0);
    }

    #[test]
    fn test_reserve_release_wakes_waiter() {
        let batch = Arc::new(PacketBatch::new());
        batch.reset(raw(&[24]), &FramingLimits::default()).unwrap();
        batch.reserve();
        batch.reserve();

        let worker = {
            let batch = Arc::clone(&batch);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                batch.release();
                batch.release();
            })
        };
        batch.release();
        batch.wait_all_released();
        assert_eq!(batch.refcount(), 0);
        worker.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_reports_stall() {
        let batch = PacketBatch::new();
        batch.reset(raw(&[24]), &FramingLimits::default()).unwrap();
        assert!(!batch.wait_all_released_timeout(Duration::from_millis(10)));
        batch.release();
        assert!(batch.wait_all_released_timeout(Duration::from_millis(10)));
    }

    #[test]
    #[should_panic(expected = "without a matching reserve")]
    fn test_over_release_panics() {
        let batch = PacketBatch::new();
        batch.reset(raw(&[24]), &FramingLimits::default()).unwrap();
        batch.release();
        batch.release();
    }

    #[test]
    #[should_panic(expected = "no references")]
    fn test_reserve_on_idle_panics() {
        PacketBatch::new().reserve();
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let batch = Arc::new(PacketBatch::new());
        batch.reset(raw(&[24]), &FramingLimits::default()).unwrap();
        {
            let lease = batch.lease();
            assert_eq!(lease.refcount(), 2);
            assert_eq!(lease.len(), 1);
        }
        assert_eq!(batch.refcount(), 1);
    }

    #[test]
    fn test_reset_from_aliases() {
        let src = PacketBatch::new();
        src.reset(raw(&[24, 40]), &FramingLimits::default()).unwrap();
        let alias = PacketBatch::new();
        alias.reset_from(&src).unwrap();
        assert_eq!(alias.refcount(), 1);
        assert_eq!(
            src.packets()[1].as_bytes().as_ptr(),
            alias.packets()[1].as_bytes().as_ptr()
        );

        let subset = PacketBatch::new();
        subset.reset_subset(&src, |p| p.kind() == PacketKind(2)).unwrap();
        assert_eq!(subset.len(), 1);
        assert_eq!(subset.packets()[0].sequence(), 1);
    }

    #[test]
    fn test_reset_packet() {
        let batch = PacketBatch::new();
        let packet = Packet::encode(PacketHeader::new(PacketKind(7), 0), &[1, 2, 3, 4]);
        batch.reset_packet(packet.clone()).unwrap();
        assert_eq!(batch.packets()[0], packet);
        assert_eq!(batch.raw().len(), 20);
    }

    #[test]
    fn test_concurrent_readers_see_identical_content() {
        let batch = Arc::new(PacketBatch::new());
        batch.reset(raw(&[24, 40, 16, 32]), &FramingLimits::default()).unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let lease = batch.lease();
                thread::spawn(move || {
                    lease
                        .packets()
                        .iter()
                        .map(|p| p.as_bytes().to_vec())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let seen: Vec<_> = readers.into_iter().map(|h| h.join().unwrap()).collect();
        for view in &seen[1..] {
            assert_eq!(view, &seen[0]);
        }
        batch.release();
        batch.wait_all_released();
    }

    proptest! {
        #[test]
        fn test_balanced_reserve_release(extra in 0usize..64) {
            let batch = PacketBatch::new();
            batch.reset(raw(&[24]), &FramingLimits::default()).unwrap();
            for _ in 0..extra {
                batch.reserve();
            }
            for _ in 0..=extra {
                batch.release();
            }
            prop_assert!(batch.wait_all_released_timeout(Duration::from_millis(1)));
        }
    }
}
