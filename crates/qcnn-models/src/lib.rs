// SPDX-License-Identifier: AGPL-3.0-only

#![deny(unsafe_code)]

//! Quantized CNN model description
//!
//! A [`Model`] is an ordered chain of layers (convolution, max pooling,
//! dense, terminal dense) with their quantized weights and per-channel
//! requantization factors. Models are validated once at construction and
//! are immutable afterwards.
//!
//! # Format
//!
//! Models are stored as `.qcnn` blobs:
//!
//! - **Header** (16 bytes): magic `QCNN`, version, layer count, fixed-point
//!   widths and ingest line layout
//! - **Layers**: geometry, bit widths, folding factors
//! - **Weights**: packed `Wbit`-bit values, LSB-first
//! - **Factors**: little-endian `i32` factorA / factorB per output channel
//!
//! # Example
//!
//! ```no_run
//! use qcnn_models::Model;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let model = Model::from_file("mnist.qcnn")?;
//!
//! println!("Layers: {}", model.layer_count());
//! println!("Weights: {}", model.total_weight_count());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

mod error;
mod model;
pub mod parser;
pub mod synthetic;
mod weights;

pub use error::{ModelError, Result};
pub use model::{LayerSpec, Model, MAX_ACCUMULATOR_BITS, MAX_ACTIVATION_BITS, MAX_FACTOR_SCALE_BITS};
pub use parser::ModelHeader;
pub use synthetic::{reference_model, selftest_model};
pub use weights::{packed_len, value_range, RequantParams, WeightTensor, MAX_WEIGHT_BITS};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{LayerSpec, Model, RequantParams, Result, WeightTensor};
}
