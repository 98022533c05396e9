//! Node abstraction for the dispatch graph.
//!
//! A node is anything that consumes batches: statistics, filters, protocol
//! handlers, transforms that publish derived batches. Every node implements
//! the single [`BatchNode`] trait; the graph wraps it in a slot that owns the
//! node's lock, counters and (for threaded nodes) its queue and worker.
//!
//! # Outputs
//!
//! Nodes never talk to subscribers directly. Anything a node wants to send
//! downstream goes into its [`NodeContext`] outbox, and the graph delivers
//! the outbox only after the node's lock has been released. A handler can
//! therefore never hold its own state lock while another node runs.

use crate::pipeline::batch::PacketBatch;
use crate::pipeline::id::NodeId;
use crate::pipeline::packet::{Packet, PacketKind};
use crate::pipeline::pool::BufferPool;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What a threaded delivery waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Completion {
    /// Return as soon as the batch is queued
    #[default]
    FireAndForget,
    /// Return once the node has finished this particular batch
    Blocking,
}

/// How the graph hands batches to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DispatchMode {
    /// Handler runs synchronously on the sender's thread
    #[default]
    Inline,
    /// Node owns a bounded queue and a worker thread
    Threaded {
        queue_depth: usize,
        completion: Completion,
    },
}

impl DispatchMode {
    pub fn threaded(queue_depth: usize) -> Self {
        DispatchMode::Threaded {
            queue_depth,
            completion: Completion::FireAndForget,
        }
    }

    pub fn threaded_blocking(queue_depth: usize) -> Self {
        DispatchMode::Threaded {
            queue_depth,
            completion: Completion::Blocking,
        }
    }

    pub fn is_threaded(&self) -> bool {
        matches!(self, DispatchMode::Threaded { .. })
    }
}

/// Set of packet kinds a node or a subscription accepts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KindFilter {
    #[default]
    All,
    Only(Vec<PacketKind>),
}

impl KindFilter {
    pub fn only(kinds: impl IntoIterator<Item = impl Into<PacketKind>>) -> Self {
        KindFilter::Only(kinds.into_iter().map(Into::into).collect())
    }

    #[inline]
    pub fn accepts(&self, kind: PacketKind) -> bool {
        match self {
            KindFilter::All => true,
            KindFilter::Only(kinds) => kinds.contains(&kind),
        }
    }

    /// Kinds accepted by both filters.
    pub fn intersect(&self, other: &KindFilter) -> KindFilter {
        match (self, other) {
            (KindFilter::All, f) | (f, KindFilter::All) => f.clone(),
            (KindFilter::Only(a), KindFilter::Only(b)) => {
                KindFilter::Only(a.iter().filter(|k| b.contains(k)).copied().collect())
            }
        }
    }

    /// At least one packet of `packets` passes.
    pub fn matches_any(&self, packets: &[Packet]) -> bool {
        match self {
            KindFilter::All => !packets.is_empty(),
            KindFilter::Only(_) => packets.iter().any(|p| self.accepts(p.kind())),
        }
    }
}

/// Context handed to a node for every batch.
pub struct NodeContext<'a> {
    node_id: NodeId,
    filter: &'a KindFilter,
    pool: &'a BufferPool,
    outbox: &'a mut Vec<Arc<PacketBatch>>,
}

impl<'a> NodeContext<'a> {
    pub(crate) fn new(
        node_id: NodeId,
        filter: &'a KindFilter,
        pool: &'a BufferPool,
        outbox: &'a mut Vec<Arc<PacketBatch>>,
    ) -> Self {
        Self {
            node_id,
            filter,
            pool,
            outbox,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Effective filter for this delivery: the subscription's filter
    /// narrowed by the node's accepted kinds.
    pub fn filter(&self) -> &KindFilter {
        self.filter
    }

    /// Shared scratch storage for derived batches.
    pub fn pool(&self) -> &BufferPool {
        self.pool
    }

    /// Packets of `batch` this node was subscribed for, in order.
    pub fn matching<'b>(&'b self, batch: &'b [Packet]) -> impl Iterator<Item = &'b Packet> + 'b {
        batch.iter().filter(move |p| self.filter.accepts(p.kind()))
    }

    /// Queue `batch` for delivery to this node's subscribers.
    ///
    /// The batch must have been reset, so that it carries the owner
    /// reference. That reference passes to the graph, which drops it after
    /// fan-out.
    pub fn publish(&mut self, batch: Arc<PacketBatch>) {
        self.outbox.push(batch);
    }

    pub fn pending_outputs(&self) -> usize {
        self.outbox.len()
    }
}

/// Trait implemented by every batch consumer.
pub trait BatchNode: Send {
    /// Human-readable name of this node.
    fn name(&self) -> &str;

    /// Kinds this node wants to see. Narrows every subscription's filter.
    fn accepted_kinds(&self) -> KindFilter {
        KindFilter::All
    }

    /// Inline or threaded. Read once when the node is added.
    fn dispatch_mode(&self) -> DispatchMode {
        DispatchMode::Inline
    }

    /// Called once before the first batch, on the thread that will run the node.
    fn on_start(&mut self, _ctx: &mut NodeContext) {}

    /// Called for every delivered batch.
    ///
    /// The batch stays valid and unchanged for the whole call. Retaining it
    /// beyond the call is not allowed; copy what must outlive it.
    fn on_batch(&mut self, batch: &PacketBatch, ctx: &mut NodeContext);

    /// Called once after the last batch.
    fn on_stop(&mut self, _ctx: &mut NodeContext) {}
}
