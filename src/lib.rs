//! # pktflow: packet ingestion and zero-copy batch dispatch
//!
//! pktflow sits between a raw byte source (a capture driver, a TCP stream, a
//! replay file) and any number of packet consumers. Bytes land in a bounded
//! circular buffer, an ingestion loop frames them into validated packets,
//! and the resulting batch is fanned out to subscribers without copying a
//! single payload byte.
//!
//! ## Architecture
//!
//! - **Ingest**: [`CircularBuffer`](ingest::CircularBuffer), the copy thread
//!   and the [`IngestionLoop`](ingest::IngestionLoop) state machine
//! - **Pipeline**: packets, the framer, reference-counted
//!   [`PacketBatch`](pipeline::PacketBatch)es and the
//!   [`DispatchGraph`](pipeline::DispatchGraph) that routes them
//! - **Config**: TOML configuration and live-tunable runtime settings
//! - **Communication**: crossbeam channels for worker queues and telemetry
//!
//! ## Backpressure
//!
//! The ingestion loop reuses one batch and waits until every subscriber has
//! released it before framing again. A slow subscriber therefore stalls the
//! loop, the buffer fills, and the copy thread eventually faults with
//! `BufferFull`. Nothing is dropped silently.
//!
//! ## Example
//!
//! ```ignore
//! use pktflow::config::FlowConfig;
//! use pktflow::ingest::{CircularBuffer, IngestionLoop};
//! use pktflow::pipeline::{nodes::StatsNode, DispatchGraph, KindFilter};
//! use pktflow::types::SourceId;
//! use std::sync::Arc;
//!
//! let config = FlowConfig::default();
//! let graph = DispatchGraph::with_queue_depth(config.dispatch.default_queue_depth);
//! let buffer = Arc::new(CircularBuffer::new(config.buffer.capacity));
//!
//! let ingest = IngestionLoop::new(SourceId(0), buffer.clone(), &graph, config.runtime_settings().into());
//! let stats = graph.add_node(StatsNode::new("stats"))?;
//! graph.subscribe(ingest.source_node(), stats, KindFilter::All)?;
//!
//! let handle = ingest.spawn()?;
//! buffer.push(&bytes);
//! ```

pub mod config;
pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod types;

// Re-export commonly used types
pub use config::{FlowConfig, RuntimeSettings, SharedSettings};
pub use error::{FlowError, Result, ResultExt};
pub use ingest::{CircularBuffer, IngestionLoop, RawSource, StreamCopier};
pub use pipeline::{BatchNode, DispatchGraph, Packet, PacketBatch, PacketKind};
pub use types::{FaultKind, FaultReport, IngestStats, SourceId, SourceStatus};
