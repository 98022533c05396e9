//! RoutingRemapNode: rewrites routing ids into a derived batch.
//!
//! Source bytes are never modified. Matching packets are re-encoded into a
//! pooled scratch buffer with their routing id replaced and the `DERIVED`
//! flag set; the buffer returns to the pool once every downstream reader is
//! done with it.

use crate::pipeline::batch::PacketBatch;
use crate::pipeline::node::{BatchNode, DispatchMode, KindFilter, NodeContext};
use crate::pipeline::nodes::OutputBatches;
use crate::pipeline::packet::{write_packet, Packet, PacketFlags, PacketHeader};
use std::collections::HashMap;

pub struct RoutingRemapNode {
    name: String,
    kinds: KindFilter,
    mode: DispatchMode,
    routes: HashMap<u32, u32>,
    /// Routing id for packets without an explicit route; `None` keeps theirs
    fallback: Option<u32>,
    outputs: OutputBatches,
}

impl RoutingRemapNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kinds: KindFilter::All,
            mode: DispatchMode::Inline,
            routes: HashMap::new(),
            fallback: None,
            outputs: OutputBatches::default(),
        }
    }

    pub fn with_kinds(mut self, kinds: KindFilter) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn route(mut self, from: u32, to: u32) -> Self {
        self.routes.insert(from, to);
        self
    }

    pub fn fallback(mut self, to: u32) -> Self {
        self.fallback = Some(to);
        self
    }

    fn remap(&self, routing_id: u32) -> u32 {
        self.routes
            .get(&routing_id)
            .copied()
            .or(self.fallback)
            .unwrap_or(routing_id)
    }
}

impl BatchNode for RoutingRemapNode {
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
        let selected: Vec<&Packet> = ctx.matching(&packets).collect();
        if selected.is_empty() {
            return;
        }

        let total: usize = selected.iter().map(|p| p.len()).sum();
        let mut scratch = ctx.pool().get(total);
        let mut headers = Vec::with_capacity(selected.len());
        for packet in &selected {
            let header = PacketHeader {
                routing_id: self.remap(packet.routing_id()),
                flags: packet.flags().with(PacketFlags::DERIVED),
                ..*packet.header()
            };
            write_packet(&mut *scratch, header, packet.payload());
            headers.push(header);
        }

        let raw = scratch.publish();
        let mut offset = 0;
        let derived: Vec<Packet> = headers
            .into_iter()
            .map(|header| {
                let len = header.total_length as usize;
                let view = raw.bytes().slice(offset..offset + len);
                offset += len;
                Packet::from_validated(header, view)
            })
            .collect();

        let out = self.outputs.acquire();
        match out.reset_packets(derived, raw) {
            Ok(()) => ctx.publish(out),
            Err(e) => tracing::error!(node = %self.name, error = %e, "cannot publish remapped batch"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::framer::FramingLimits;
    use crate::pipeline::graph::DispatchGraph;
    use crate::pipeline::packet::{PacketKind, RawBuffer};
    use bytes::BytesMut;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Capture(Arc<Mutex<Vec<Packet>>>);

    impl BatchNode for Capture {
        fn name(&self) -> &str {
            "capture"
        }

        fn on_batch(&mut self, batch: &PacketBatch, _ctx: &mut NodeContext) {
            self.0.lock().extend(batch.packets().iter().cloned());
        }
    }

    fn batch(routes: &[u32]) -> Arc<PacketBatch> {
        let mut buf = BytesMut::new();
        for (i, r) in routes.iter().enumerate() {
            let header = PacketHeader::new(PacketKind(1), 0)
                .with_routing_id(*r)
                .with_sequence(i as u32);
            write_packet(&mut buf, header, &[i as u8; 4]);
        }
        let batch = Arc::new(PacketBatch::new());
        batch
            .reset(RawBuffer::new(buf.freeze()), &FramingLimits::default())
            .unwrap();
        batch
    }

    #[test]
    fn test_remaps_into_pooled_storage() {
        let graph = DispatchGraph::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let src = graph.add_source("src");
        let remap = graph
            .add_node(RoutingRemapNode::new("remap").route(10, 99).fallback(0))
            .unwrap();
        let sink = graph.add_node(Capture(Arc::clone(&seen))).unwrap();
        graph.subscribe(src, remap, KindFilter::All).unwrap();
        graph.subscribe(remap, sink, KindFilter::All).unwrap();

        let input = batch(&[10, 11]);
        graph.publish(src, &input).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].routing_id(), 99);
        assert_eq!(seen[1].routing_id(), 0);
        assert!(seen[0].flags().contains(PacketFlags::DERIVED));
        assert_eq!(seen[1].payload(), &[1, 1, 1, 1]);

        // original untouched
        assert_eq!(input.packets()[0].routing_id(), 10);
        assert!(!input.packets()[0].flags().contains(PacketFlags::DERIVED));

        // Capture still holds packet views, so the buffer is on loan
        assert_eq!(graph.pool().size(), 1);
    }

    #[test]
    fn test_scratch_returns_to_pool() {
        let graph = DispatchGraph::new();
        let src = graph.add_source("src");
        let remap = graph.add_node(RoutingRemapNode::new("remap")).unwrap();
        let sink = graph.add_node(crate::pipeline::nodes::StatsNode::new("s")).unwrap();
        graph.subscribe(src, remap, KindFilter::All).unwrap();
        graph.subscribe(remap, sink, KindFilter::All).unwrap();

        for _ in 0..4 {
            graph.publish(src, &batch(&[1, 2, 3])).unwrap();
        }
        // The idle output batch still aliases the last buffer
        assert!(graph.pool().size() <= 1);
        assert!(graph.pool().capacity() <= 2);
    }
}
