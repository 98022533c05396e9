//! Ingestion: getting bytes from a source into the dispatch graph.
//!
//! # Architecture
//!
//! ```text
//!  io::Read ──► StreamCopier ──► CircularBuffer ──► IngestionLoop ──► DispatchGraph
//!  (tcp/file)   copy thread      (RawSource)        ingest thread       │
//!                                                        │              ▼
//!                                                 StatusMonitor     subscribers
//!                                                 status thread
//! ```
//!
//! Each source gets exactly one [`IngestionLoop`]. Everything the loop
//! touches from other threads is behind [`IngestShared`]: counters, status,
//! current state and the stop flag.

pub mod backoff;
pub mod circular;
pub mod copier;
pub mod monitor;
pub mod source;
pub mod worker;

pub use backoff::{Backoff, RetryPolicy};
pub use circular::CircularBuffer;
pub use copier::{CopierConfig, CopierHandle, StreamCopier};
pub use monitor::{MonitorHandle, StatusMonitor};
pub use source::{RawSource, WaitOutcome};
pub use worker::{
    CycleOutcome, FaultHandler, IngestHandle, IngestShared, IngestState, IngestionLoop, LoopExit,
};
