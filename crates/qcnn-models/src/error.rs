// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for model construction and parsing

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for model operations
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors raised while building, validating or parsing a model
#[derive(Debug, Error)]
pub enum ModelError {
    /// File not found or cannot be read
    #[error("Model file not found: {path}")]
    FileNotFound {
        /// Path that was attempted
        path: PathBuf,
    },

    /// Invalid magic bytes
    #[error("Invalid model header: expected magic bytes \"QCNN\"")]
    InvalidHeader,

    /// Unsupported blob version
    #[error("Unsupported model blob version: {version} (expected 1)")]
    UnsupportedVersion {
        /// Version field from the blob
        version: u16,
    },

    /// Blob parsing failed
    #[error("Failed to parse model: {reason}")]
    ParseError {
        /// Reason for failure
        reason: String,
    },

    /// Invalid layer geometry or folding
    #[error("Invalid layer {layer}: {reason}")]
    InvalidLayer {
        /// Layer name
        layer: String,
        /// Reason for failure
        reason: String,
    },

    /// Bit width outside the supported range
    #[error("Unsupported bit width in {layer}: {reason}")]
    BitWidth {
        /// Layer name (or `model` for global widths)
        layer: String,
        /// Reason for failure
        reason: String,
    },

    /// Accumulator too narrow for the layer's fan-in
    #[error("Accumulator overflow risk in {layer}: Mbit={mbit}, need at least {required}")]
    AccumulatorOverflow {
        /// Layer name
        layer: String,
        /// Declared accumulator width
        mbit: u32,
        /// Minimum safe width
        required: u32,
    },

    /// Weight or requantization tensor does not match the layer shape
    #[error("Parameter shape mismatch in {layer}: {what} has {actual}, expected {expected}")]
    WeightShape {
        /// Layer name
        layer: String,
        /// Which tensor
        what: &'static str,
        /// Expected element count
        expected: usize,
        /// Actual element count
        actual: usize,
    },

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl ModelError {
    /// Create a parse error
    pub fn parse_error(reason: impl Into<String>) -> Self {
        Self::ParseError {
            reason: reason.into(),
        }
    }

    /// Create an invalid layer error
    pub fn invalid_layer(layer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidLayer {
            layer: layer.into(),
            reason: reason.into(),
        }
    }

    /// Create a bit width error
    pub fn bit_width(layer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BitWidth {
            layer: layer.into(),
            reason: reason.into(),
        }
    }

    /// Create a parameter shape error
    pub fn weight_shape(
        layer: impl Into<String>,
        what: &'static str,
        expected: usize,
        actual: usize,
    ) -> Self {
        Self::WeightShape {
            layer: layer.into(),
            what,
            expected,
            actual,
        }
    }
}
