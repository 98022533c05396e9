//! IngestionLoop: drains one RawSource into the dispatch graph.
//!
//! One loop per source, on its own thread. A cycle walks
//!
//! ```text
//! WaitData ─► Parse ─► Dispatch ─► AwaitRelease ─► Advance ─► WaitData
//!               │  ▲
//!               ▼  │
//!          RetryBackoff           (any fatal error) ─► Fault
//! ```
//!
//! The batch is reused every cycle, so the loop cannot reframe until every
//! subscriber has released it. That wait is the backpressure point: a slow
//! subscriber stalls ingestion and the buffer fills up behind it.
//!
//! Only bytes of validated packets are consumed. A partial tail stays in the
//! source and is reframed next cycle together with whatever arrived since.

use crate::config::SharedSettings;
use crate::error::{FlowError, Result};
use crate::ingest::backoff::Backoff;
use crate::ingest::source::{RawSource, WaitOutcome};
use crate::pipeline::{DispatchGraph, FrameSummary, NodeId, PacketBatch, PipelineError, RawBuffer};
use crate::types::{FaultKind, FaultReport, IngestCounters, IngestStats, SourceId, SourceStatus};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Where the loop currently is, for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IngestState {
    #[default]
    Idle,
    WaitData,
    Parse,
    RetryBackoff,
    Dispatch,
    AwaitRelease,
    Advance,
    Fault,
    Done,
}

/// Transitions of one cycle, carrying what the next state needs.
enum Step {
    WaitData,
    Parse(RawBuffer),
    RetryBackoff { seen: usize },
    Dispatch(FrameSummary),
    AwaitRelease(FrameSummary),
    Advance(FrameSummary),
    Done(CycleOutcome),
}

impl Step {
    fn state(&self) -> IngestState {
        match self {
            Step::WaitData => IngestState::WaitData,
            Step::Parse(_) => IngestState::Parse,
            Step::RetryBackoff { .. } => IngestState::RetryBackoff,
            Step::Dispatch(_) => IngestState::Dispatch,
            Step::AwaitRelease(_) => IngestState::AwaitRelease,
            Step::Advance(_) => IngestState::Advance,
            Step::Done(_) => IngestState::Done,
        }
    }
}

/// Result of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No data arrived within the wait timeout
    Idle,
    /// A batch went out and its bytes were consumed
    Dispatched { packets: usize, consumed: usize },
    /// Shutdown was requested or the graph stopped accepting batches
    Stopped,
}

/// Why [`IngestionLoop::run`] returned.
#[derive(Debug, Clone)]
pub enum LoopExit {
    Stopped,
    Faulted(FaultReport),
}

/// Receives the report when a loop halts on a fault.
pub trait FaultHandler: Send {
    fn on_fault(&mut self, report: &FaultReport);
}

impl<F> FaultHandler for F
where
    F: FnMut(&FaultReport) + Send,
{
    fn on_fault(&mut self, report: &FaultReport) {
        self(report)
    }
}

/// State of a loop visible to other threads.
pub struct IngestShared {
    source_id: SourceId,
    counters: IngestCounters,
    status: Mutex<SourceStatus>,
    state: Mutex<IngestState>,
    running: AtomicBool,
}

impl IngestShared {
    fn new(source_id: SourceId) -> Self {
        Self {
            source_id,
            counters: IngestCounters::new(),
            status: Mutex::new(SourceStatus::Idle),
            state: Mutex::new(IngestState::Idle),
            running: AtomicBool::new(true),
        }
    }

    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    pub fn counters(&self) -> &IngestCounters {
        &self.counters
    }

    pub fn status(&self) -> SourceStatus {
        *self.status.lock()
    }

    pub fn state(&self) -> IngestState {
        *self.state.lock()
    }

    /// Request shutdown. Honoured at the next wait for data or once the
    /// in-flight batch has been released.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Telemetry snapshot. Samples (and so resets) the source's rate meters.
    pub fn stats(&self, source: &dyn RawSource) -> IngestStats {
        IngestStats {
            source_id: self.source_id,
            status: self.status(),
            counters: self.counters.snapshot(),
            push_rate: source.push_rate(),
            read_rate: source.read_rate(),
            buffer_used: source.used(),
            buffer_capacity: source.capacity(),
            last_fault: self.counters.last_fault(),
            taken_at: Utc::now(),
        }
    }

    fn set_status(&self, status: SourceStatus) {
        *self.status.lock() = status;
    }

    fn set_state(&self, state: IngestState) {
        *self.state.lock() = state;
    }
}

/// Ingestion state machine for one source.
pub struct IngestionLoop {
    shared: Arc<IngestShared>,
    source: Arc<dyn RawSource>,
    graph: DispatchGraph,
    node: NodeId,
    settings: SharedSettings,
    batch: Arc<PacketBatch>,
    backoff: Backoff,
    fault_handler: Option<Box<dyn FaultHandler>>,
}

impl IngestionLoop {
    /// Create a loop and register it as a source node named `ingest-{id}`.
    pub fn new(
        source_id: SourceId,
        source: Arc<dyn RawSource>,
        graph: &DispatchGraph,
        settings: SharedSettings,
    ) -> Self {
        let node = graph.add_source(format!("ingest-{}", source_id));
        Self {
            shared: Arc::new(IngestShared::new(source_id)),
            source,
            graph: graph.clone(),
            node,
            settings,
            batch: Arc::new(PacketBatch::new()),
            backoff: Backoff::new(),
            fault_handler: None,
        }
    }

    pub fn with_fault_handler(mut self, handler: impl FaultHandler + 'static) -> Self {
        self.fault_handler = Some(Box::new(handler));
        self
    }

    /// Graph node batches are published from; subscribe consumers to it.
    pub fn source_node(&self) -> NodeId {
        self.node
    }

    pub fn shared(&self) -> Arc<IngestShared> {
        Arc::clone(&self.shared)
    }

    pub fn source(&self) -> Arc<dyn RawSource> {
        Arc::clone(&self.source)
    }

    /// Run one cycle. Errors are fatal for the loop.
    pub fn run_cycle(&mut self) -> Result<CycleOutcome> {
        let settings = self.settings.snapshot();
        let mut step = Step::WaitData;

        loop {
            self.shared.set_state(step.state());
            step = match step {
                Step::WaitData => {
                    if !self.shared.is_running() {
                        Step::Done(CycleOutcome::Stopped)
                    } else {
                        match self.source.wait(settings.wait_timeout)? {
                            WaitOutcome::Ready(raw) => Step::Parse(raw),
                            WaitOutcome::Timeout => Step::Done(CycleOutcome::Idle),
                        }
                    }
                }

                Step::Parse(raw) => {
                    let seen = raw.len();
                    let summary = self.batch.reset(raw, &settings.limits)?;
                    if summary.packets > 0 {
                        self.backoff.reset();
                        Step::Dispatch(summary)
                    } else {
                        // Nothing to hand out; give the owner reference back
                        // so the next reset is allowed.
                        self.batch.release();
                        if summary.incomplete {
                            Step::RetryBackoff { seen }
                        } else {
                            Step::Done(CycleOutcome::Idle)
                        }
                    }
                }

                Step::RetryBackoff { seen } => {
                    let Some(delay) = self.backoff.next_delay(&settings.retry) else {
                        let attempts = self.backoff.attempts();
                        self.backoff.reset();
                        return Err(FlowError::source_fault(
                            FaultKind::RetryExhausted,
                            format!("partial packet still incomplete after {} retries", attempts),
                        ));
                    };
                    self.shared.counters.record_retry();
                    tracing::debug!(
                        source_id = %self.shared.source_id,
                        attempt = self.backoff.attempts(),
                        ?delay,
                        seen,
                        "incomplete packet, backing off"
                    );
                    match self.source.wait_more(seen, delay)? {
                        WaitOutcome::Ready(raw) => Step::Parse(raw),
                        WaitOutcome::Timeout => Step::Done(CycleOutcome::Idle),
                    }
                }

                Step::Dispatch(summary) => match self.graph.publish(self.node, &self.batch) {
                    Ok(report) => {
                        self.shared.counters.record_received(summary.packets);
                        if report.unmatched_packets > 0 {
                            self.shared.counters.record_dropped(report.unmatched_packets);
                        }
                        Step::AwaitRelease(summary)
                    }
                    Err(PipelineError::NotActive) => {
                        self.batch.release();
                        tracing::info!(source_id = %self.shared.source_id, "graph shut down");
                        Step::Done(CycleOutcome::Stopped)
                    }
                    Err(err) => {
                        self.batch.release();
                        return Err(err.into());
                    }
                },

                Step::AwaitRelease(summary) => {
                    self.await_release(settings.stall_threshold);
                    Step::Advance(summary)
                }

                Step::Advance(summary) => {
                    self.source.consume(summary.consumed)?;
                    self.shared
                        .counters
                        .record_processed(summary.packets, summary.consumed);
                    tracing::trace!(
                        source_id = %self.shared.source_id,
                        packets = summary.packets,
                        consumed = summary.consumed,
                        "cycle complete"
                    );
                    if self.shared.is_running() {
                        Step::Done(CycleOutcome::Dispatched {
                            packets: summary.packets,
                            consumed: summary.consumed,
                        })
                    } else {
                        Step::Done(CycleOutcome::Stopped)
                    }
                }

                Step::Done(outcome) => return Ok(outcome),
            };
        }
    }

    /// Drop the owner reference and wait for every subscriber.
    fn await_release(&self, stall_threshold: std::time::Duration) {
        self.batch.release();
        while !self.batch.wait_all_released_timeout(stall_threshold) {
            self.shared.counters.record_stall();
            self.shared.set_status(SourceStatus::Stalled);
            tracing::warn!(
                source_id = %self.shared.source_id,
                refcount = self.batch.refcount(),
                "subscriber stall, batch still held"
            );
        }
        if self.shared.status() == SourceStatus::Stalled {
            tracing::info!(source_id = %self.shared.source_id, "subscribers caught up");
            self.shared.set_status(SourceStatus::Running);
        }
    }

    /// Run cycles until stopped or a fatal fault.
    pub fn run(&mut self) -> LoopExit {
        tracing::info!(source_id = %self.shared.source_id, node = ?self.node, "ingestion loop started");
        self.shared.set_status(SourceStatus::Running);

        let exit = loop {
            match self.run_cycle() {
                Ok(CycleOutcome::Stopped) => break LoopExit::Stopped,
                Ok(_) => {}
                Err(err) => break LoopExit::Faulted(self.fault(err)),
            }
        };

        if let LoopExit::Stopped = exit {
            self.shared.set_status(SourceStatus::Stopped);
            self.shared.set_state(IngestState::Done);
            let counters = self.shared.counters.snapshot();
            tracing::info!(
                source_id = %self.shared.source_id,
                processed = counters.packets_processed,
                bytes = counters.bytes_consumed,
                "ingestion loop stopped"
            );
        }
        exit
    }

    /// Record the fault, notify the handler and build the report.
    fn fault(&mut self, err: FlowError) -> FaultReport {
        let kind = err.fault_kind();
        self.shared.counters.record_fault(kind);
        self.shared.set_status(SourceStatus::Faulted);
        self.shared.set_state(IngestState::Fault);

        let report = FaultReport {
            source_id: self.shared.source_id,
            kind,
            message: err.to_string(),
            counters: self.shared.counters.snapshot(),
            at: Utc::now(),
        };
        tracing::error!(
            source_id = %report.source_id,
            %kind,
            error = %report.message,
            processed = report.counters.packets_processed,
            "ingestion loop faulted"
        );
        if let Some(handler) = self.fault_handler.as_mut() {
            handler.on_fault(&report);
        }
        report
    }

    /// Move the loop onto its own thread, named `pktflow-ingest-{id}`.
    pub fn spawn(mut self) -> std::io::Result<IngestHandle> {
        let shared = Arc::clone(&self.shared);
        let source_id = shared.source_id;
        let thread = std::thread::Builder::new()
            .name(format!("pktflow-ingest-{}", source_id))
            .spawn(move || self.run())?;
        Ok(IngestHandle { shared, thread })
    }
}

/// Handle to a spawned ingestion loop.
pub struct IngestHandle {
    shared: Arc<IngestShared>,
    thread: JoinHandle<LoopExit>,
}

impl IngestHandle {
    pub fn shared(&self) -> Arc<IngestShared> {
        Arc::clone(&self.shared)
    }

    pub fn stop(&self) {
        self.shared.request_stop();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    pub fn join(self) -> LoopExit {
        let shared = self.shared;
        self.thread.join().unwrap_or_else(|_| {
            shared.counters.record_fault(FaultKind::Internal);
            LoopExit::Faulted(FaultReport {
                source_id: shared.source_id,
                kind: FaultKind::Internal,
                message: "ingestion thread panicked".to_string(),
                counters: shared.counters.snapshot(),
                at: Utc::now(),
            })
        })
    }
}
