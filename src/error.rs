//! Error handling for pktflow
//!
//! This module defines the crate-wide error type and a Result alias used by
//! the ingestion side (sources, buffers, the ingestion loop) and by the
//! configuration layer. Graph/topology errors live in
//! [`crate::pipeline::PipelineError`]; framing failures in
//! [`crate::pipeline::FramingError`]. Both convert into [`FlowError`].

use crate::pipeline::{FramingError, PipelineError};
use crate::types::FaultKind;
use thiserror::Error;

/// Main error type for pktflow operations
#[derive(Error, Debug)]
pub enum FlowError {
    /// The framer found no valid packet boundary at the start of a region
    #[error("Corrupt framing: {0}")]
    CorruptFraming(#[from] FramingError),

    /// The raw source reported a fault while waiting for data
    #[error("Source fault ({kind}): {message}")]
    SourceFault { kind: FaultKind, message: String },

    /// A consume request exceeded the region handed out by the last wait
    #[error("Consume of {requested} bytes exceeds {available} available")]
    ConsumeOverrun { requested: usize, available: usize },

    /// A batch was reset while consumers still held references to it
    #[error("Batch still reserved (refcount {refcount})")]
    BatchBusy { refcount: usize },

    /// Errors raised by the dispatch graph
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<FlowError>,
    },
}

impl FlowError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        FlowError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Build a source fault of the given kind
    pub fn source_fault(kind: FaultKind, message: impl Into<String>) -> Self {
        FlowError::SourceFault {
            kind,
            message: message.into(),
        }
    }

    /// Classify this error into the fault taxonomy surfaced to fault handlers
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            FlowError::CorruptFraming(_) => FaultKind::CorruptFraming,
            FlowError::SourceFault { kind, .. } => *kind,
            FlowError::Io(_) => FaultKind::Io,
            FlowError::WithContext { source, .. } => source.fault_kind(),
            _ => FaultKind::Internal,
        }
    }
}

/// Result type alias for pktflow operations
pub type Result<T> = std::result::Result<T, FlowError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<FlowError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().with_context(f()))
    }
}
