//! Worker threads for threaded nodes.
//!
//! Each threaded node owns one bounded queue and one worker. A queued item
//! carries the lease the graph reserved for it, so the reference is given
//! back whether the item is handled, discarded with the queue, or unwound
//! past by a panicking handler. For blocking deliveries the worker
//! acknowledges once the lease is dropped. It exits once every sender is
//! gone and the queue is drained.

use crate::pipeline::batch::BatchLease;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::graph::{GraphInner, NodeSlot};
use crate::pipeline::node::KindFilter;
use crossbeam_channel::{Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// One queued delivery.
pub(crate) struct WorkItem {
    /// Reference reserved for this node, released on drop
    pub batch: BatchLease,
    pub filter: KindFilter,
    /// Signalled after the batch was released
    pub ack: Option<Sender<()>>,
}

pub(crate) fn spawn_worker(
    slot: Arc<NodeSlot>,
    graph: Weak<GraphInner>,
    rx: Receiver<WorkItem>,
) -> PipelineResult<JoinHandle<()>> {
    let name = slot.name().to_string();
    std::thread::Builder::new()
        .name(format!("pktflow-{}", name))
        .spawn(move || run(slot, graph, rx))
        .map_err(|source| PipelineError::Spawn { node: name, source })
}

fn run(slot: Arc<NodeSlot>, graph: Weak<GraphInner>, rx: Receiver<WorkItem>) {
    tracing::debug!(node = slot.name(), "worker started");
    if let Some(inner) = graph.upgrade() {
        inner.start_node(&slot);
    }

    for WorkItem { batch, filter, ack } in rx.iter() {
        match graph.upgrade() {
            Some(inner) => inner.run_node(&slot, &batch, &filter),
            None => tracing::warn!(node = slot.name(), "graph dropped, discarding batch"),
        }
        drop(batch);
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    if let Some(inner) = graph.upgrade() {
        inner.stop_node(&slot);
    }
    tracing::debug!(node = slot.name(), "worker stopped");
}
