//! Pipeline-specific error types.

use crate::pipeline::id::{EdgeId, NodeId};
use thiserror::Error;

/// Errors that can occur within the dispatch graph.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Unknown node {0:?}")]
    UnknownNode(NodeId),

    #[error("Unknown edge {0:?}")]
    UnknownEdge(EdgeId),

    #[error("Invalid edge: {0}")]
    InvalidEdge(String),

    #[error("Subscribing {consumer:?} to {producer:?} would create a cycle")]
    CycleDetected { producer: NodeId, consumer: NodeId },

    #[error("Node {node_id:?} error: {message}")]
    Node { node_id: NodeId, message: String },

    #[error("Node {0:?} has shut down")]
    NodeShutDown(NodeId),

    #[error("Failed to spawn worker for node {node}: {source}")]
    Spawn {
        node: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Channel send error")]
    ChannelSend,

    #[error("Channel receive error")]
    ChannelRecv,

    #[error("Dispatch graph is shut down")]
    NotActive,
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
