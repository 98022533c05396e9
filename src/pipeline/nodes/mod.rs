//! Built-in dispatch graph nodes.

pub mod filter;
pub mod remap;
pub mod stats;

pub use filter::KindFilterNode;
pub use remap::RoutingRemapNode;
pub use stats::{KindStats, StatsHandle, StatsNode, StatsTable};

use crate::pipeline::batch::PacketBatch;
use std::sync::Arc;

/// Output batches owned by a transform node.
///
/// Reuses a batch once every subscriber let go of it, so a steady stream
/// settles on as many batches as are in flight downstream.
#[derive(Default)]
pub(crate) struct OutputBatches {
    batches: Vec<Arc<PacketBatch>>,
}

impl OutputBatches {
    pub(crate) fn acquire(&mut self) -> Arc<PacketBatch> {
        if let Some(idle) = self.batches.iter().find(|b| b.refcount() == 0) {
            return Arc::clone(idle);
        }
        let fresh = Arc::new(PacketBatch::new());
        self.batches.push(Arc::clone(&fresh));
        fresh
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.batches.len()
    }
}
