//! Zero-copy packet framing and batch dispatch.
//!
//! Raw bytes are framed into a [`PacketBatch`] of packet views, and the
//! batch is fanned out through a [`DispatchGraph`] to every subscribed
//! node. Nodes run inline on the publishing thread or on their own worker
//! behind a bounded queue; transform nodes publish derived batches built
//! from pooled scratch storage.
//!
//! # Architecture
//!
//! ```text
//! RawBuffer ──► Framer ──► PacketBatch (refcounted)
//!                               │
//!                         DispatchGraph::publish
//!                  ┌────────────┼─────────────┐
//!                  ▼            ▼             ▼
//!             [StatsNode] [KindFilterNode] [threaded node]
//!                               │             (queue + worker)
//!                               ▼
//!                        [RoutingRemapNode] ──► derived batch ──► ...
//! ```
//!
//! # Design
//!
//! - **Views, not copies**: packets are `Bytes` slices of the raw region.
//! - **Refcounted batches**: one reference per subscriber, the owner waits
//!   for all of them before reusing the batch.
//! - **Outbox**: node outputs are delivered after the node lock is released.
//! - **Two backpressure points**: full worker queues and unreleased batches.

pub mod batch;
pub mod error;
pub mod framer;
pub mod graph;
pub mod id;
pub mod node;
pub mod nodes;
pub mod packet;
pub mod pool;
mod worker;

pub use batch::{BatchLease, FrameSummary, PacketBatch};
pub use error::{PipelineError, PipelineResult};
pub use framer::{FrameOutcome, Framer, FramingError, FramingLimits};
pub use graph::{DispatchGraph, DispatchReport, NodeStats, DEFAULT_QUEUE_DEPTH};
pub use id::{EdgeId, NodeId};
pub use node::{BatchNode, Completion, DispatchMode, KindFilter, NodeContext};
pub use packet::{
    write_packet, Packet, PacketFlags, PacketHeader, PacketKind, RawBuffer, HEADER_SIZE,
};
pub use pool::{BufferPool, ObjectPool, PoolItem, Pooled};
