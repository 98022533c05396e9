//! Mock sources and recording nodes

use crossbeam_channel::{bounded, Receiver, Sender};
use mockall::mock;
use parking_lot::Mutex;
use pktflow::ingest::{RawSource, WaitOutcome};
use pktflow::pipeline::{BatchNode, DispatchMode, KindFilter, NodeContext, PacketBatch};
use std::sync::Arc;
use std::time::Duration;

mock! {
    pub Source {}

    impl RawSource for Source {
        fn wait(&self, timeout: Duration) -> pktflow::Result<WaitOutcome>;
        fn consume(&self, len: usize) -> pktflow::Result<()>;
        fn clear(&self);
        fn used(&self) -> usize;
        fn capacity(&self) -> usize;
    }
}

/// What a [`RecordingNode`] saw for one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seen {
    pub sequences: Vec<u32>,
    pub bytes: usize,
}

/// Records the sequence numbers of every matching packet
pub struct RecordingNode {
    name: String,
    kinds: KindFilter,
    mode: DispatchMode,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl RecordingNode {
    pub fn new(name: &str) -> (Self, Arc<Mutex<Vec<Seen>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                name: name.to_string(),
                kinds: KindFilter::All,
                mode: DispatchMode::Inline,
                seen: seen.clone(),
            },
            seen,
        )
    }

    pub fn with_kinds(mut self, kinds: KindFilter) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }
}

impl BatchNode for RecordingNode {
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
        let matching: Vec<_> = ctx.matching(&packets).collect();
        self.seen.lock().push(Seen {
            sequences: matching.iter().map(|p| p.sequence()).collect(),
            bytes: matching.iter().map(|p| p.len()).sum(),
        });
    }
}

/// Threaded node that holds every batch until its gate is opened
pub struct GatedNode {
    gate: Receiver<()>,
    entered: Sender<()>,
}

impl GatedNode {
    /// Returns the node, the gate sender and a receiver signalled on entry
    pub fn new() -> (Self, Sender<()>, Receiver<()>) {
        let (gate_tx, gate_rx) = bounded(16);
        let (entered_tx, entered_rx) = bounded(16);
        (
            Self {
                gate: gate_rx,
                entered: entered_tx,
            },
            gate_tx,
            entered_rx,
        )
    }
}

impl BatchNode for GatedNode {
    fn name(&self) -> &str {
        "gated"
    }

    fn dispatch_mode(&self) -> DispatchMode {
        DispatchMode::threaded(4)
    }

    fn on_batch(&mut self, _batch: &PacketBatch, _ctx: &mut NodeContext) {
        let _ = self.entered.send(());
        let _ = self.gate.recv();
    }
}
