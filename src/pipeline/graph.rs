//! DispatchGraph: node registry, subscriptions and batch fan-out.
//!
//! The graph is a cheap cloneable handle. Ingestion loops publish into it
//! from their own threads, threaded nodes run on their own workers, and
//! registration can happen at any time.
//!
//! # Fan-out
//!
//! ```text
//! publish(producer, batch)
//!   1. snapshot matching subscriptions under the subscription lock
//!   2. one lease (reserved reference) per matched subscriber
//!   3. deliver: inline → run handler here, drop the lease
//!               threaded → enqueue the lease (blocking when full)
//! ```
//!
//! A subscription matches when the batch holds at least one packet whose
//! kind passes both the subscription filter and the consumer's accepted
//! kinds. Per (producer, subscriber) pair, batches arrive in publish order.
//!
//! # Locks
//!
//! `edges` is always taken before `slots`. Neither is held while a node
//! runs, and a node's own lock is released before its outputs are
//! delivered.

use crate::pipeline::batch::{BatchLease, PacketBatch};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::{EdgeId, NodeId};
use crate::pipeline::node::{BatchNode, Completion, DispatchMode, KindFilter, NodeContext};
use crate::pipeline::pool::BufferPool;
use crate::pipeline::worker::{spawn_worker, WorkItem};
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Queue depth used when a threaded node asks for 0.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Per-node counters.
#[derive(Default)]
struct NodeCounters {
    delivered: AtomicU64,
    processed: AtomicU64,
    packets: AtomicU64,
    outputs: AtomicU64,
    backpressure: AtomicU64,
}

/// Snapshot of one node's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStats {
    pub id: u32,
    pub name: String,
    pub is_source: bool,
    /// Batches handed to the node (inline call or enqueue)
    pub batches_delivered: u64,
    /// Batches whose handler returned
    pub batches_processed: u64,
    /// Matching packets seen by the handler
    pub packets_processed: u64,
    /// Derived batches the node published
    pub outputs_published: u64,
    /// Enqueues that found the node's queue full
    pub backpressure_events: u64,
}

/// Result of one publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchReport {
    /// Subscribers the batch was handed to
    pub subscribers: usize,
    /// Packets no subscriber was interested in
    pub unmatched_packets: usize,
    /// Deliveries that failed because the consumer was gone
    pub failed: usize,
}

enum SlotRole {
    Source,
    Consumer {
        node: Mutex<Box<dyn BatchNode>>,
        accepted: KindFilter,
        mode: DispatchMode,
        queue: Mutex<Option<Sender<WorkItem>>>,
        worker: Mutex<Option<JoinHandle<()>>>,
    },
}

/// A registered node plus everything the graph keeps for it.
pub(crate) struct NodeSlot {
    id: NodeId,
    name: String,
    role: SlotRole,
    counters: NodeCounters,
}

impl NodeSlot {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn accepted(&self) -> Option<&KindFilter> {
        match &self.role {
            SlotRole::Source => None,
            SlotRole::Consumer { accepted, .. } => Some(accepted),
        }
    }

    fn stats(&self) -> NodeStats {
        let c = &self.counters;
        NodeStats {
            id: self.id.0,
            name: self.name.clone(),
            is_source: matches!(self.role, SlotRole::Source),
            batches_delivered: c.delivered.load(Ordering::Relaxed),
            batches_processed: c.processed.load(Ordering::Relaxed),
            packets_processed: c.packets.load(Ordering::Relaxed),
            outputs_published: c.outputs.load(Ordering::Relaxed),
            backpressure_events: c.backpressure.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
struct Edge {
    producer: NodeId,
    consumer: NodeId,
    filter: KindFilter,
}

#[derive(Default)]
struct EdgeEntry {
    generation: u32,
    edge: Option<Edge>,
}

/// Subscription storage indexed by `EdgeId`. A position freed by
/// `unsubscribe` is handed to the next subscription with its generation
/// bumped, so subscribe/unsubscribe churn does not grow the table.
#[derive(Default)]
struct EdgeTable {
    entries: Vec<EdgeEntry>,
    free: Vec<usize>,
}

impl EdgeTable {
    fn live(&self) -> impl Iterator<Item = &Edge> + '_ {
        self.entries.iter().filter_map(|e| e.edge.as_ref())
    }

    fn insert(&mut self, edge: Edge) -> EdgeId {
        match self.free.pop() {
            Some(pos) => {
                let entry = &mut self.entries[pos];
                entry.edge = Some(edge);
                EdgeId::new(pos, entry.generation)
            }
            None => {
                self.entries.push(EdgeEntry {
                    generation: 0,
                    edge: Some(edge),
                });
                EdgeId::new(self.entries.len() - 1, 0)
            }
        }
    }

    fn remove(&mut self, id: EdgeId) -> Option<Edge> {
        let entry = self.entries.get_mut(id.index())?;
        if entry.generation != id.generation() {
            return None;
        }
        let edge = entry.edge.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.index());
        Some(edge)
    }

    /// Positions allocated so far, live or free.
    #[cfg(test)]
    fn allocated(&self) -> usize {
        self.entries.len()
    }
}

pub(crate) struct GraphInner {
    slots: RwLock<Vec<Arc<NodeSlot>>>,
    edges: RwLock<EdgeTable>,
    pool: BufferPool,
    default_queue_depth: usize,
    active: AtomicBool,
}

/// Shared handle to a dispatch graph.
#[derive(Clone)]
pub struct DispatchGraph {
    inner: Arc<GraphInner>,
}

impl Default for DispatchGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchGraph {
    pub fn new() -> Self {
        Self::with_queue_depth(DEFAULT_QUEUE_DEPTH)
    }

    /// Graph whose threaded nodes default to `default_queue_depth`.
    pub fn with_queue_depth(default_queue_depth: usize) -> Self {
        Self {
            inner: Arc::new(GraphInner {
                slots: RwLock::new(Vec::new()),
                edges: RwLock::new(EdgeTable::default()),
                pool: BufferPool::new(true),
                default_queue_depth: default_queue_depth.max(1),
                active: AtomicBool::new(true),
            }),
        }
    }

    // ── Registration ──

    /// Register a producer-only node, e.g. an ingestion loop.
    pub fn add_source(&self, name: impl Into<String>) -> NodeId {
        let name = name.into();
        let mut slots = self.inner.slots.write();
        let id = NodeId::at(slots.len());
        tracing::info!(node = %name, ?id, "added source");
        slots.push(Arc::new(NodeSlot {
            id,
            name,
            role: SlotRole::Source,
            counters: NodeCounters::default(),
        }));
        id
    }

    /// Register a consumer. Threaded nodes get their queue and worker here.
    pub fn add_node<N: BatchNode + 'static>(&self, node: N) -> PipelineResult<NodeId> {
        self.add_boxed(Box::new(node))
    }

    pub fn add_boxed(&self, node: Box<dyn BatchNode>) -> PipelineResult<NodeId> {
        if !self.inner.active.load(Ordering::Acquire) {
            return Err(PipelineError::NotActive);
        }

        let name = node.name().to_string();
        let accepted = node.accepted_kinds();
        let mode = match node.dispatch_mode() {
            DispatchMode::Threaded {
                queue_depth: 0,
                completion,
            } => DispatchMode::Threaded {
                queue_depth: self.inner.default_queue_depth,
                completion,
            },
            mode => mode,
        };

        let (tx, rx) = match mode {
            DispatchMode::Threaded { queue_depth, .. } => {
                let (tx, rx) = bounded(queue_depth);
                (Some(tx), Some(rx))
            }
            DispatchMode::Inline => (None, None),
        };

        let slot = {
            let mut slots = self.inner.slots.write();
            let slot = Arc::new(NodeSlot {
                id: NodeId::at(slots.len()),
                name,
                role: SlotRole::Consumer {
                    node: Mutex::new(node),
                    accepted,
                    mode,
                    queue: Mutex::new(tx),
                    worker: Mutex::new(None),
                },
                counters: NodeCounters::default(),
            });
            slots.push(Arc::clone(&slot));
            slot
        };
        tracing::info!(node = slot.name(), id = ?slot.id, ?mode, "added node");

        match rx {
            Some(rx) => {
                let handle = spawn_worker(Arc::clone(&slot), Arc::downgrade(&self.inner), rx)?;
                if let SlotRole::Consumer { worker, .. } = &slot.role {
                    *worker.lock() = Some(handle);
                }
            }
            None => self.inner.start_node(&slot),
        }
        Ok(slot.id)
    }

    /// Deliver `producer`'s batches that carry kinds passing `filter` to
    /// `consumer`.
    pub fn subscribe(
        &self,
        producer: NodeId,
        consumer: NodeId,
        filter: KindFilter,
    ) -> PipelineResult<EdgeId> {
        let mut edges = self.inner.edges.write();
        let slots = self.inner.slots.read();

        slots
            .get(producer.index())
            .ok_or(PipelineError::UnknownNode(producer))?;
        let consumer_slot = slots
            .get(consumer.index())
            .ok_or(PipelineError::UnknownNode(consumer))?;

        if producer == consumer {
            return Err(PipelineError::InvalidEdge(format!(
                "{:?} cannot subscribe to itself",
                consumer
            )));
        }
        if consumer_slot.accepted().is_none() {
            return Err(PipelineError::InvalidEdge(format!(
                "source {:?} cannot consume batches",
                consumer
            )));
        }
        if edges
            .live()
            .any(|e| e.producer == producer && e.consumer == consumer)
        {
            return Err(PipelineError::InvalidEdge(format!(
                "{:?} already subscribed to {:?}",
                consumer, producer
            )));
        }
        if would_create_cycle(&edges, slots.len(), producer, consumer) {
            return Err(PipelineError::CycleDetected { producer, consumer });
        }

        let id = edges.insert(Edge {
            producer,
            consumer,
            filter,
        });
        tracing::info!(?producer, ?consumer, ?id, "subscribed");
        Ok(id)
    }

    /// Remove a subscription. Batches already handed over still complete.
    /// The handle goes stale even once its position is reused.
    pub fn unsubscribe(&self, edge: EdgeId) -> PipelineResult<()> {
        match self.inner.edges.write().remove(edge) {
            Some(_) => {
                tracing::info!(?edge, "unsubscribed");
                Ok(())
            }
            None => Err(PipelineError::UnknownEdge(edge)),
        }
    }

    // ── Dispatch ──

    /// Fan `batch` out to `producer`'s subscribers.
    ///
    /// The caller keeps its own reference; every subscriber gets one more
    /// and releases it independently.
    pub fn publish(&self, producer: NodeId, batch: &Arc<PacketBatch>) -> PipelineResult<DispatchReport> {
        if !self.inner.active.load(Ordering::Acquire) {
            return Err(PipelineError::NotActive);
        }
        if producer.index() >= self.inner.slots.read().len() {
            return Err(PipelineError::UnknownNode(producer));
        }
        Ok(self.inner.fan_out(producer, batch))
    }

    /// Consumers currently subscribed to `producer`.
    pub fn subscribers(&self, producer: NodeId) -> Vec<NodeId> {
        self.inner
            .edges
            .read()
            .live()
            .filter(|e| e.producer == producer)
            .map(|e| e.consumer)
            .collect()
    }

    pub fn node_stats(&self, id: NodeId) -> PipelineResult<NodeStats> {
        self.inner
            .slots
            .read()
            .get(id.index())
            .map(|slot| slot.stats())
            .ok_or(PipelineError::UnknownNode(id))
    }

    pub fn all_stats(&self) -> Vec<NodeStats> {
        self.inner.slots.read().iter().map(|s| s.stats()).collect()
    }

    pub fn node_count(&self) -> usize {
        self.inner.slots.read().len()
    }

    /// Scratch storage shared by transform nodes.
    pub fn pool(&self) -> &BufferPool {
        &self.inner.pool
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Stop accepting batches, then drain and stop every node upstream
    /// first, so outputs produced while draining still reach their
    /// subscribers.
    pub fn shutdown(&self) {
        if !self.inner.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let order = self.inner.topological_order();
        tracing::info!(nodes = order.len(), "shutting down dispatch graph");

        for slot in order {
            let SlotRole::Consumer { queue, worker, mode, .. } = &slot.role else {
                continue;
            };
            match mode {
                DispatchMode::Inline => self.inner.stop_node(&slot),
                DispatchMode::Threaded { .. } => {
                    drop(queue.lock().take());
                    let handle = worker.lock().take();
                    if let Some(handle) = handle {
                        if handle.join().is_err() {
                            tracing::error!(node = slot.name(), "worker panicked");
                        }
                    }
                }
            }
        }
    }
}

impl GraphInner {
    pub(crate) fn fan_out(&self, producer: NodeId, batch: &Arc<PacketBatch>) -> DispatchReport {
        let packets = batch.packets();
        let mut report = DispatchReport::default();
        if packets.is_empty() {
            return report;
        }

        let targets: Vec<(Arc<NodeSlot>, KindFilter)> = {
            let edges = self.edges.read();
            let slots = self.slots.read();
            edges
                .live()
                .filter(|e| e.producer == producer)
                .filter_map(|e| {
                    let slot = slots.get(e.consumer.index())?;
                    let filter = e.filter.intersect(slot.accepted()?);
                    filter
                        .matches_any(&packets)
                        .then(|| (Arc::clone(slot), filter))
                })
                .collect()
        };

        report.unmatched_packets = packets
            .iter()
            .filter(|p| !targets.iter().any(|(_, f)| f.accepts(p.kind())))
            .count();

        // Reserve every reference before the first handler can run
        let leases: Vec<BatchLease> = targets.iter().map(|_| batch.lease()).collect();
        for ((slot, filter), lease) in targets.into_iter().zip(leases) {
            match self.deliver(&slot, lease, filter) {
                Ok(()) => report.subscribers += 1,
                Err(e) => {
                    tracing::warn!(node = slot.name(), error = %e, "delivery failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Hand one reserved reference to `slot`. Whatever path drops the lease
    /// releases the reference, including a failed enqueue.
    fn deliver(
        &self,
        slot: &Arc<NodeSlot>,
        lease: BatchLease,
        filter: KindFilter,
    ) -> PipelineResult<()> {
        let SlotRole::Consumer { mode, queue, .. } = &slot.role else {
            return Err(PipelineError::InvalidEdge(format!(
                "{:?} is a source",
                slot.id
            )));
        };
        slot.counters.delivered.fetch_add(1, Ordering::Relaxed);

        let completion = match mode {
            DispatchMode::Inline => {
                self.run_node(slot, &lease, &filter);
                return Ok(());
            }
            DispatchMode::Threaded { completion, .. } => *completion,
        };

        let Some(tx) = queue.lock().clone() else {
            return Err(PipelineError::NodeShutDown(slot.id));
        };

        let (ack_tx, ack_rx) = match completion {
            Completion::Blocking => {
                let (t, r) = bounded(1);
                (Some(t), Some(r))
            }
            Completion::FireAndForget => (None, None),
        };
        let item = WorkItem {
            batch: lease,
            filter,
            ack: ack_tx,
        };

        match tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                slot.counters.backpressure.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(node = slot.name(), "queue full, blocking producer");
                if tx.send(item).is_err() {
                    return Err(PipelineError::NodeShutDown(slot.id));
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err(PipelineError::NodeShutDown(slot.id));
            }
        }

        if let Some(ack) = ack_rx {
            ack.recv().map_err(|_| PipelineError::ChannelRecv)?;
        }
        Ok(())
    }

    /// Run the handler under the node lock, then deliver its outputs.
    pub(crate) fn run_node(&self, slot: &NodeSlot, batch: &PacketBatch, filter: &KindFilter) {
        let SlotRole::Consumer { node, .. } = &slot.role else {
            return;
        };
        let mut outbox = Vec::new();
        let matched = {
            let mut node = node.lock();
            let mut ctx = NodeContext::new(slot.id, filter, &self.pool, &mut outbox);
            node.on_batch(batch, &mut ctx);
            let packets = batch.packets();
            let matched = ctx.matching(&packets).count();
            matched
        };
        slot.counters.processed.fetch_add(1, Ordering::Relaxed);
        slot.counters.packets.fetch_add(matched as u64, Ordering::Relaxed);
        self.flush_outbox(slot, outbox);
    }

    pub(crate) fn start_node(&self, slot: &NodeSlot) {
        self.lifecycle(slot, |node, ctx| node.on_start(ctx));
    }

    pub(crate) fn stop_node(&self, slot: &NodeSlot) {
        self.lifecycle(slot, |node, ctx| node.on_stop(ctx));
    }

    fn lifecycle<F>(&self, slot: &NodeSlot, hook: F)
    where
        F: FnOnce(&mut Box<dyn BatchNode>, &mut NodeContext),
    {
        let SlotRole::Consumer { node, accepted, .. } = &slot.role else {
            return;
        };
        let mut outbox = Vec::new();
        {
            let mut node = node.lock();
            let mut ctx = NodeContext::new(slot.id, accepted, &self.pool, &mut outbox);
            hook(&mut *node, &mut ctx);
        }
        self.flush_outbox(slot, outbox);
    }

    /// Publish derived batches, then drop the owner reference each one
    /// carried. The owner never waits for subscribers.
    fn flush_outbox(&self, slot: &NodeSlot, outbox: Vec<Arc<PacketBatch>>) {
        for out in outbox {
            if out.refcount() == 0 {
                tracing::warn!(node = slot.name(), "published batch was never reset, dropped");
                continue;
            }
            slot.counters.outputs.fetch_add(1, Ordering::Relaxed);
            self.fan_out(slot.id, &out);
            out.release();
        }
    }

    /// Kahn's algorithm over live edges.
    fn topological_order(&self) -> Vec<Arc<NodeSlot>> {
        let edges = self.edges.read();
        let slots = self.slots.read();
        let n = slots.len();

        let mut in_degree = vec![0usize; n];
        for e in edges.live() {
            in_degree[e.consumer.index()] += 1;
        }
        let mut queue: std::collections::VecDeque<usize> =
            (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(idx) = queue.pop_front() {
            order.push(Arc::clone(&slots[idx]));
            for e in edges.live() {
                if e.producer.index() == idx {
                    let c = e.consumer.index();
                    in_degree[c] -= 1;
                    if in_degree[c] == 0 {
                        queue.push_back(c);
                    }
                }
            }
        }
        order
    }
}

impl Drop for GraphInner {
    fn drop(&mut self) {
        // Close queues so detached workers exit once drained
        for slot in self.slots.get_mut().iter() {
            if let SlotRole::Consumer { queue, .. } = &slot.role {
                drop(queue.lock().take());
            }
        }
    }
}

/// `consumer` can already reach `producer`, so `producer → consumer`
/// would close a loop.
fn would_create_cycle(edges: &EdgeTable, nodes: usize, producer: NodeId, consumer: NodeId) -> bool {
    let mut visited = vec![false; nodes];
    let mut stack = vec![consumer];

    while let Some(current) = stack.pop() {
        if current == producer {
            return true;
        }
        let idx = current.index();
        if idx >= nodes || visited[idx] {
            continue;
        }
        visited[idx] = true;
        for edge in edges.live() {
            if edge.producer == current {
                stack.push(edge.consumer);
            }
        }
    }
    false
}
