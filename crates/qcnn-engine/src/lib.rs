// SPDX-License-Identifier: AGPL-3.0-only

//! Streaming inference engine for quantized CNNs.
//!
//! A model is turned into a chain of independent stages connected by
//! bounded channels. Each stage runs on its own thread and processes one
//! image at a time; the only synchronization is channel backpressure.
//!
//! # Stage chain
//!
//! ```text
//! ingest (512 → element bits)
//!   → conv / pool / dense(act) … in model order
//!   → dense(no-act) raw scores
//!   → egress (scores → 512-bit word)
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use qcnn_engine::{Engine, EngineConfig, InferenceExecutor};
//! use qcnn_models::reference_model;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let model = reference_model(0)?;
//! let engine = Engine::new(&model, EngineConfig::default())?;
//! let executor = InferenceExecutor::new(engine);
//!
//! let image = [0u8; 28 * 28];
//! let result = executor.infer_pixels(&[&image[..]])?;
//! println!("class {} scores {:?}", result.predictions[0], result.scores[0]);
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`pipeline`] | `Engine`, `EngineConfig`, threaded and sequential runs |
//! | [`stages`] | `Stage` trait, repack / conv / pool / dense primitives |
//! | [`lanes`] | InP/OutP channel lanes on rayon pools |
//! | [`requant`] | Affine requantization, activation, raw scores |
//! | [`stream`] | Bounded links, `ElementSource` / `ElementSink` |
//! | [`monitor`] | Passive stream taps |
//! | [`transport`] | Host packing, score decoding, argmax, word files |

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]

mod error;
mod inference;
pub mod lanes;
pub mod monitor;
pub mod pipeline;
pub mod requant;
pub mod stages;
pub mod stream;
pub mod transport;
pub mod window;

pub use error::{EngineError, Result};
pub use inference::{InferenceExecutor, InferenceResult};
pub use monitor::{Observation, RecordingMonitor, StreamMonitor, TracingMonitor};
pub use pipeline::{Engine, EngineConfig};
pub use stages::Stage;
pub use transport::{argmax, decode_scores, pack_image_lines, ScoreLayout};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        Engine, EngineConfig, EngineError, InferenceExecutor, InferenceResult, RecordingMonitor,
        Result, StreamMonitor, TracingMonitor,
    };
}
