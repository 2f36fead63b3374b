// SPDX-License-Identifier: AGPL-3.0-only

//! Quantized 2D convolution stage.

use super::{pull_checked, Stage};
use crate::error::Result;
use crate::lanes::Lanes;
use crate::requant::Requantizer;
use crate::stream::{ElementSink, ElementSource};
use crate::window::LineBuffer;
use qcnn_core::{BitWord, LayerConfig, StreamShape};
use qcnn_models::WeightTensor;
use tracing::trace;

/// Convolution + per-channel requantization + quantized activation.
///
/// Emits one `Cout · Abit`-bit element per output position, raster order.
#[derive(Debug)]
pub struct ConvStage {
    name: String,
    config: LayerConfig,
    weights: WeightTensor,
    requant: Requantizer,
    lanes: Lanes,
}

impl ConvStage {
    /// Build from validated parameters.
    pub fn new(
        name: &str,
        config: LayerConfig,
        weights: WeightTensor,
        requant: Requantizer,
        lanes: Lanes,
    ) -> Self {
        Self {
            name: name.to_owned(),
            config,
            weights,
            requant,
            lanes,
        }
    }

    /// Layer configuration.
    pub const fn config(&self) -> &LayerConfig {
        &self.config
    }
}

impl Stage for ConvStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_shape(&self) -> StreamShape {
        self.config.input_shape()
    }

    fn output_shape(&self) -> StreamShape {
        let c = &self.config;
        StreamShape::square(c.dout(), c.cout, self.requant.rule().width() as usize)
    }

    fn process_image(
        &self,
        input: &mut dyn ElementSource,
        output: &mut dyn ElementSink,
    ) -> Result<()> {
        let c = &self.config;
        let in_shape = self.input_shape();
        let out_bits = self.requant.rule().width() as usize;
        let dout = c.dout();

        let mut lines = LineBuffer::new(c.k, c.s, c.din);
        let mut window = Vec::with_capacity(c.fan_in());
        let mut acc = vec![0i64; c.cout];

        for _ in 0..in_shape.elements() {
            let element = pull_checked(&self.name, input, in_shape.element_bits())?;
            let Some(oy) = lines.push(element) else {
                continue;
            };
            for ox in 0..dout {
                lines.gather(ox, c.cin, c.ibit as usize, &mut window);
                self.lanes.accumulate(&self.weights, &window, &mut acc);
                let mut out = BitWord::zero(c.cout * out_bits);
                for (ch, &a) in acc.iter().enumerate() {
                    out.set(ch * out_bits, out_bits, self.requant.apply(ch, a));
                }
                output.push(out)?;
            }
            trace!("{}: output row {} done", self.name, oy);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requant::OutputRule;
    use qcnn_core::FixedPoint;
    use qcnn_models::RequantParams;
    use std::collections::VecDeque;

    const FIXED: FixedPoint = FixedPoint {
        scale_bits: 0,
        factor_scale_bits: 8,
    };

    fn config(cout: usize) -> LayerConfig {
        LayerConfig {
            k: 2,
            s: 1,
            din: 3,
            cin: 1,
            cout,
            ibit: 4,
            wbit: 2,
            mbit: 12,
            abit: 4,
            in_p: 1,
            out_p: 1,
        }
    }

    fn image(values: &[u64]) -> VecDeque<BitWord> {
        values.iter().map(|&v| BitWord::from_u64(4, v)).collect()
    }

    #[test]
    fn test_two_channel_convolution() {
        // ch0 sums the window, ch1 = top-left − bottom-right
        let weights = WeightTensor::new(2, vec![1, 1, 1, 1, 1, 0, 0, -1]).unwrap();
        let stage = ConvStage::new(
            "conv",
            config(2),
            weights,
            Requantizer::new(
                OutputRule::Activation { abit: 4 },
                Some(RequantParams::identity(2, 8)),
                FIXED,
            ),
            Lanes::sequential(1, 1),
        );
        let mut src = image(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let mut out = Vec::new();
        stage.process_image(&mut src, &mut out).unwrap();
        assert_eq!(out.len(), 4);
        let ch0: Vec<u64> = out.iter().map(|w| w.get(0, 4)).collect();
        let ch1: Vec<u64> = out.iter().map(|w| w.get(4, 4)).collect();
        // 12, 16, 24, 28 saturate at 15
        assert_eq!(ch0, vec![12, 15, 15, 15]);
        // 1−5, 2−6, … are all negative → ReLU 0
        assert_eq!(ch1, vec![0, 0, 0, 0]);
        assert_eq!(stage.output_shape(), StreamShape::square(2, 2, 4));
    }

    #[test]
    fn test_image_boundary_leaves_no_state() {
        let weights = WeightTensor::new(2, vec![1, 0, 0, 1]).unwrap();
        let stage = ConvStage::new(
            "conv",
            config(1),
            weights,
            Requantizer::new(
                OutputRule::Activation { abit: 4 },
                Some(RequantParams::identity(1, 8)),
                FIXED,
            ),
            Lanes::sequential(1, 1),
        );
        let a = [1, 1, 1, 1, 1, 1, 1, 1, 1];
        let b = [0, 1, 2, 3, 4, 5, 6, 7, 0];
        let mut both = image(&a);
        both.extend(image(&b));
        let mut joint = Vec::new();
        stage.process_image(&mut both, &mut joint).unwrap();
        stage.process_image(&mut both, &mut joint).unwrap();

        let mut alone = Vec::new();
        stage.process_image(&mut image(&b), &mut alone).unwrap();
        assert_eq!(&joint[4..], alone.as_slice());
    }
}
