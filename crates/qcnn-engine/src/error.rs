// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for engine construction and execution

use qcnn_core::StreamShape;
use qcnn_models::ModelError;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while building or running the pipeline
#[derive(Debug, Error)]
pub enum EngineError {
    /// Model description rejected
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// Producer output does not match consumer input
    #[error("Shape mismatch between {producer} and {consumer}: produces {produced}, expects {expected}")]
    ShapeMismatch {
        /// Upstream stage
        producer: String,
        /// Downstream stage
        consumer: String,
        /// Shape emitted by the producer
        produced: StreamShape,
        /// Shape required by the consumer
        expected: StreamShape,
    },

    /// External payload width incompatible with the stream it feeds
    #[error("Payload width error in {stage}: {reason}")]
    PayloadWidth {
        /// Stage or boundary name
        stage: String,
        /// Reason for failure
        reason: String,
    },

    /// Host buffer too small for the requested repetitions
    #[error("{what} buffer holds {actual} words, need {expected}")]
    BufferSize {
        /// Which buffer
        what: &'static str,
        /// Required word count
        expected: usize,
        /// Supplied word count
        actual: usize,
    },

    /// Neighbouring stage went away mid-run
    #[error("Stream closed: {stream}")]
    StreamClosed {
        /// Stream name
        stream: String,
    },

    /// A stage worker panicked
    #[error("Stage worker panicked: {stage}")]
    WorkerPanicked {
        /// Stage name
        stage: String,
    },

    /// Lane thread pool could not be created
    #[error("Failed to build lane pool for {stage}: {reason}")]
    ThreadPool {
        /// Stage name
        stage: String,
        /// Reason for failure
        reason: String,
    },

    /// Monitor requested for a stream the engine does not have
    #[error("Unknown stream: {name}")]
    UnknownStream {
        /// Requested stream name
        name: String,
    },

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl EngineError {
    /// Create a payload width error
    pub fn payload_width(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PayloadWidth {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Create a stream closed error
    pub fn stream_closed(stream: impl Into<String>) -> Self {
        Self::StreamClosed {
            stream: stream.into(),
        }
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(
        producer: impl Into<String>,
        consumer: impl Into<String>,
        produced: StreamShape,
        expected: StreamShape,
    ) -> Self {
        Self::ShapeMismatch {
            producer: producer.into(),
            consumer: consumer.into(),
            produced,
            expected,
        }
    }

    /// True for the secondary failure a stage reports when a neighbour exits
    pub const fn is_stream_closed(&self) -> bool {
        matches!(self, Self::StreamClosed { .. })
    }
}
