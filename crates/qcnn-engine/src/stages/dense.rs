// SPDX-License-Identifier: AGPL-3.0-only

//! Fully connected stage (with activation or raw scores).

use super::{pull_checked, Stage};
use crate::error::Result;
use crate::lanes::Lanes;
use crate::requant::Requantizer;
use crate::stream::{ElementSink, ElementSource};
use qcnn_core::{BitWord, LayerConfig, StreamShape};
use qcnn_models::WeightTensor;
use tracing::trace;

/// Flattens the whole upstream image (raster, then channel) into one
/// `Din` vector and emits a single element of `Dout` fields.
#[derive(Debug)]
pub struct DenseStage {
    name: String,
    config: LayerConfig,
    upstream: StreamShape,
    weights: WeightTensor,
    requant: Requantizer,
    lanes: Lanes,
}

impl DenseStage {
    /// Build from validated parameters; `upstream.values()` equals `Din`.
    pub fn new(
        name: &str,
        config: LayerConfig,
        upstream: StreamShape,
        weights: WeightTensor,
        requant: Requantizer,
        lanes: Lanes,
    ) -> Self {
        Self {
            name: name.to_owned(),
            config,
            upstream,
            weights,
            requant,
            lanes,
        }
    }
}

impl Stage for DenseStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_shape(&self) -> StreamShape {
        self.upstream
    }

    fn output_shape(&self) -> StreamShape {
        StreamShape::vector(self.config.cout, self.requant.rule().width() as usize)
    }

    fn process_image(
        &self,
        input: &mut dyn ElementSource,
        output: &mut dyn ElementSink,
    ) -> Result<()> {
        let up = self.upstream;
        let mut vector = Vec::with_capacity(self.config.cin);
        for _ in 0..up.elements() {
            let element = pull_checked(&self.name, input, up.element_bits())?;
            #[allow(clippy::cast_possible_wrap)]
            vector.extend(element.fields(up.bits, up.channels).map(|v| v as i64));
        }

        let mut acc = vec![0i64; self.config.cout];
        self.lanes.accumulate(&self.weights, &vector, &mut acc);

        let bits = self.requant.rule().width() as usize;
        let mut out = BitWord::zero(acc.len() * bits);
        for (o, &a) in acc.iter().enumerate() {
            out.set(o * bits, bits, self.requant.apply(o, a));
        }
        trace!("{}: {:?}", self.name, acc);
        output.push(out)
    }
}
