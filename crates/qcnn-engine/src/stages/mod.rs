// SPDX-License-Identifier: AGPL-3.0-only

//! Pipeline stage primitives
//!
//! Four stage kinds make up every pipeline:
//! - **Repack**: width conversion at the host boundary (ingest, egress)
//! - **Conv**: windowed convolution + requantization + activation
//! - **Pool**: windowed per-channel max
//! - **Dense**: fully connected, with activation or raw scores
//!
//! Each stage consumes exactly one image from its source and emits exactly
//! one image to its sink per [`Stage::process_image`] call, and keeps no
//! state between calls.

pub mod conv;
pub mod dense;
pub mod pool;
pub mod repack;

pub use conv::ConvStage;
pub use dense::DenseStage;
pub use pool::PoolStage;
pub use repack::RepackStage;

use crate::error::{EngineError, Result};
use crate::lanes::Lanes;
use crate::requant::{OutputRule, Requantizer};
use crate::stream::{ElementSink, ElementSource};
use qcnn_core::{FixedPoint, LayerKind, StreamShape};
use qcnn_models::{LayerSpec, ModelError};

/// One concurrent worker of the pipeline.
pub trait Stage: Send + Sync {
    /// Stage name; also names the stream it produces
    fn name(&self) -> &str;

    /// Shape of one image on the input stream
    fn input_shape(&self) -> StreamShape;

    /// Shape of one image on the output stream
    fn output_shape(&self) -> StreamShape;

    /// Consume one image from `input` and emit one image to `output`.
    ///
    /// # Errors
    ///
    /// Returns error if a neighbouring stream closes or an element has the
    /// wrong width.
    fn process_image(
        &self,
        input: &mut dyn ElementSource,
        output: &mut dyn ElementSink,
    ) -> Result<()>;
}

impl std::fmt::Debug for dyn Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{} → {}]",
            self.name(),
            self.input_shape(),
            self.output_shape()
        )
    }
}

/// Instantiate the stage for one layer, checking it accepts `upstream`.
///
/// # Errors
///
/// Returns error if the layer cannot consume `upstream` or its lane pool
/// cannot be built.
pub fn build_layer_stage(
    spec: &LayerSpec,
    producer: &str,
    upstream: StreamShape,
    fixed: FixedPoint,
    lane_thread_cap: usize,
) -> Result<Box<dyn Stage>> {
    let c = spec.config;
    let missing = |what: &str| {
        EngineError::from(ModelError::invalid_layer(&spec.name, format!("missing {what}")))
    };

    if spec.kind.is_dense() {
        if upstream.values() != c.cin || upstream.bits != c.ibit as usize {
            return Err(EngineError::shape_mismatch(
                producer,
                &spec.name,
                upstream,
                StreamShape::vector(c.cin, c.ibit as usize),
            ));
        }
    } else if upstream != c.input_shape() {
        return Err(EngineError::shape_mismatch(
            producer,
            &spec.name,
            upstream,
            c.input_shape(),
        ));
    }

    let stage: Box<dyn Stage> = match spec.kind {
        LayerKind::Pool => Box::new(PoolStage::new(&spec.name, c)),
        LayerKind::Conv => {
            let weights = spec.weights.clone().ok_or_else(|| missing("weights"))?;
            let requant = Requantizer::new(
                OutputRule::Activation { abit: c.abit },
                Some(spec.requant.clone().ok_or_else(|| missing("requantization factors"))?),
                fixed,
            );
            let lanes = Lanes::new(&spec.name, c.in_p, c.out_p, lane_thread_cap)?;
            Box::new(ConvStage::new(&spec.name, c, weights, requant, lanes))
        }
        LayerKind::Dense | LayerKind::DenseNoAct => {
            let weights = spec.weights.clone().ok_or_else(|| missing("weights"))?;
            let rule = if spec.kind == LayerKind::Dense {
                OutputRule::Activation { abit: c.abit }
            } else {
                OutputRule::Score { mbit: c.mbit }
            };
            let requant = Requantizer::new(rule, spec.requant.clone(), fixed);
            let lanes = Lanes::new(&spec.name, c.in_p, c.out_p, lane_thread_cap)?;
            Box::new(DenseStage::new(&spec.name, c, upstream, weights, requant, lanes))
        }
    };
    Ok(stage)
}

/// Pull an element and check its width.
pub(crate) fn pull_checked(
    stage: &str,
    input: &mut dyn ElementSource,
    width: usize,
) -> Result<qcnn_core::BitWord> {
    let word = input.pull()?;
    if word.width() != width {
        return Err(EngineError::payload_width(
            stage,
            format!("received {}-bit element, expected {width}", word.width()),
        ));
    }
    Ok(word)
}
