//! StatsNode: per-kind packet and byte counters.
//!
//! Packets carrying the error flag are counted separately as bad packets
//! and do not show up under their kind.

use crate::pipeline::batch::PacketBatch;
use crate::pipeline::node::{BatchNode, KindFilter, NodeContext};
use crate::pipeline::packet::{PacketFlags, PacketKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Counters for one kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindStats {
    pub packets: u64,
    pub bytes: u64,
}

impl KindStats {
    fn add(&mut self, bytes: usize) {
        self.packets += 1;
        self.bytes += bytes as u64;
    }
}

/// Everything a [`StatsNode`] has counted so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsTable {
    pub total: KindStats,
    pub bad: KindStats,
    pub by_kind: BTreeMap<PacketKind, KindStats>,
    pub batches: u64,
}

impl StatsTable {
    pub fn kind(&self, kind: PacketKind) -> KindStats {
        self.by_kind.get(&kind).copied().unwrap_or_default()
    }
}

/// Read side of a [`StatsNode`], usable after the node moved into a graph.
#[derive(Debug, Clone, Default)]
pub struct StatsHandle(Arc<Mutex<StatsTable>>);

impl StatsHandle {
    pub fn snapshot(&self) -> StatsTable {
        self.0.lock().clone()
    }

    pub fn reset(&self) {
        *self.0.lock() = StatsTable::default();
    }
}

/// Inline statistics node.
pub struct StatsNode {
    name: String,
    accepted: KindFilter,
    table: StatsHandle,
}

impl StatsNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            accepted: KindFilter::All,
            table: StatsHandle::default(),
        }
    }

    pub fn with_filter(mut self, accepted: KindFilter) -> Self {
        self.accepted = accepted;
        self
    }

    pub fn handle(&self) -> StatsHandle {
        self.table.clone()
    }
}

impl BatchNode for StatsNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepted_kinds(&self) -> KindFilter {
        self.accepted.clone()
    }

    fn on_batch(&mut self, batch: &PacketBatch, ctx: &mut NodeContext) {
        let packets = batch.packets();
        let mut table = self.table.0.lock();
        table.batches += 1;
        for packet in ctx.matching(&packets) {
            table.total.add(packet.len());
            if packet.flags().contains(PacketFlags::ERROR) {
                table.bad.add(packet.len());
            } else {
                table.by_kind.entry(packet.kind()).or_default().add(packet.len());
            }
        }
    }

    fn on_stop(&mut self, _ctx: &mut NodeContext) {
        let table = self.table.0.lock();
        tracing::info!(
            node = %self.name,
            packets = table.total.packets,
            bytes = table.total.bytes,
            bad = table.bad.packets,
            "stats node stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::framer::FramingLimits;
    use crate::pipeline::graph::DispatchGraph;
    use crate::pipeline::packet::{write_packet, PacketHeader, RawBuffer};
    use bytes::BytesMut;

    fn batch(specs: &[(u16, usize, bool)]) -> Arc<PacketBatch> {
        let mut buf = BytesMut::new();
        for (kind, payload, bad) in specs {
            let mut header = PacketHeader::new(PacketKind(*kind), 0);
            if *bad {
                header = header.with_flags(PacketFlags::ERROR);
            }
            write_packet(&mut buf, header, &vec![0u8; *payload]);
        }
        let batch = Arc::new(PacketBatch::new());
        batch
            .reset(RawBuffer::new(buf.freeze()), &FramingLimits::default())
            .unwrap();
        batch
    }

    #[test]
    fn test_counts_per_kind() {
        let graph = DispatchGraph::new();
        let node = StatsNode::new("stats");
        let handle = node.handle();
        let src = graph.add_source("src");
        let id = graph.add_node(node).unwrap();
        graph.subscribe(src, id, KindFilter::All).unwrap();

        graph
            .publish(src, &batch(&[(1, 8, false), (2, 24, false), (1, 0, false), (3, 4, true)]))
            .unwrap();

        let table = handle.snapshot();
        assert_eq!(table.batches, 1);
        assert_eq!(table.total, KindStats { packets: 4, bytes: 24 + 40 + 16 + 20 });
        assert_eq!(table.kind(PacketKind(1)), KindStats { packets: 2, bytes: 40 });
        assert_eq!(table.kind(PacketKind(2)).packets, 1);
        assert_eq!(table.bad, KindStats { packets: 1, bytes: 20 });
        assert_eq!(table.kind(PacketKind(3)), KindStats::default());

        handle.reset();
        assert_eq!(handle.snapshot(), StatsTable::default());
    }

    #[test]
    fn test_accepted_kinds_narrow_counting() {
        let graph = DispatchGraph::new();
        let node = StatsNode::new("stats").with_filter(KindFilter::only([2u16]));
        let handle = node.handle();
        let src = graph.add_source("src");
        let id = graph.add_node(node).unwrap();
        graph.subscribe(src, id, KindFilter::All).unwrap();

        graph.publish(src, &batch(&[(1, 8, false), (2, 8, false)])).unwrap();
        assert_eq!(handle.snapshot().total.packets, 1);
    }
}
