//! KindFilterNode: pass-through forwarding of selected kinds.
//!
//! When every packet of a batch passes, the whole batch is aliased.
//! Otherwise the passing packets are collected into a new batch that still
//! points into the original raw region, so no payload is ever copied.

use crate::pipeline::batch::PacketBatch;
use crate::pipeline::node::{BatchNode, DispatchMode, KindFilter, NodeContext};
use crate::pipeline::nodes::OutputBatches;

pub struct KindFilterNode {
    name: String,
    kinds: KindFilter,
    mode: DispatchMode,
    outputs: OutputBatches,
    forwarded: u64,
}

impl KindFilterNode {
    pub fn new(name: impl Into<String>, kinds: KindFilter) -> Self {
        Self {
            name: name.into(),
            kinds,
            mode: DispatchMode::Inline,
            outputs: OutputBatches::default(),
            forwarded: 0,
        }
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }
}

impl BatchNode for KindFilterNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepted_kinds(&self) -> KindFilter {
        self.kinds.clone()
    }

    fn dispatch_mode(&self) -> DispatchMode {
        self.mode
    }

    fn on_batch(&mut self, batch: &PacketBatch, ctx: &mut NodeContext) {
        let packets = batch.packets();
        let passing = ctx.matching(&packets).count();
        if passing == 0 {
            return;
        }

        let out = self.outputs.acquire();
        let result = if passing == packets.len() {
            out.reset_from(batch)
        } else {
            let filter = ctx.filter().clone();
            out.reset_subset(batch, |p| filter.accepts(p.kind()))
        };

        match result {
            Ok(()) => {
                self.forwarded += passing as u64;
                ctx.publish(out);
            }
            Err(e) => tracing::error!(node = %self.name, error = %e, "cannot forward batch"),
        }
    }

    fn on_stop(&mut self, _ctx: &mut NodeContext) {
        tracing::debug!(node = %self.name, forwarded = self.forwarded, "filter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::framer::FramingLimits;
    use crate::pipeline::graph::DispatchGraph;
    use crate::pipeline::nodes::StatsNode;
    use crate::pipeline::packet::{write_packet, PacketHeader, PacketKind, RawBuffer};
    use bytes::BytesMut;
    use std::sync::Arc;

    fn batch(kinds: &[u16]) -> Arc<PacketBatch> {
        let mut buf = BytesMut::new();
        for k in kinds {
            write_packet(&mut buf, PacketHeader::new(PacketKind(*k), 0), &[7u8; 8]);
        }
        let batch = Arc::new(PacketBatch::new());
        batch
            .reset(RawBuffer::new(buf.freeze()), &FramingLimits::default())
            .unwrap();
        batch
    }

    #[test]
    fn test_forwards_only_selected_kinds() {
        let graph = DispatchGraph::new();
        let src = graph.add_source("src");
        let filter = graph
            .add_node(KindFilterNode::new("only-2", KindFilter::only([2u16])))
            .unwrap();
        let stats = StatsNode::new("stats");
        let handle = stats.handle();
        let sink = graph.add_node(stats).unwrap();
        graph.subscribe(src, filter, KindFilter::All).unwrap();
        graph.subscribe(filter, sink, KindFilter::All).unwrap();

        let input = batch(&[1, 2, 2, 3]);
        graph.publish(src, &input).unwrap();
        graph.publish(src, &batch(&[1])).unwrap();

        let table = handle.snapshot();
        assert_eq!(table.total.packets, 2);
        assert_eq!(table.batches, 1);
        assert_eq!(input.refcount(), 1);
    }

    #[test]
    fn test_full_match_aliases_batch() {
        let graph = DispatchGraph::new();
        let src = graph.add_source("src");
        let filter = graph
            .add_node(KindFilterNode::new("all", KindFilter::All))
            .unwrap();
        let sink = graph.add_node(StatsNode::new("stats")).unwrap();
        graph.subscribe(src, filter, KindFilter::All).unwrap();
        graph.subscribe(filter, sink, KindFilter::All).unwrap();

        for _ in 0..3 {
            graph.publish(src, &batch(&[1, 2])).unwrap();
        }
        let stats = graph.node_stats(filter).unwrap();
        assert_eq!(stats.outputs_published, 3);
        assert_eq!(graph.node_stats(sink).unwrap().packets_processed, 6);
    }
}
