// SPDX-License-Identifier: AGPL-3.0-only

//! Spatial max pooling stage.

use super::{pull_checked, Stage};
use crate::error::Result;
use crate::stream::{ElementSink, ElementSource};
use crate::window::LineBuffer;
use qcnn_core::{BitWord, LayerConfig, StreamShape};

/// Per-channel max over each `K × K` window. Channels and widths pass
/// through unchanged.
#[derive(Debug, Clone)]
pub struct PoolStage {
    name: String,
    config: LayerConfig,
}

impl PoolStage {
    /// Build from a validated pooling configuration.
    pub fn new(name: &str, config: LayerConfig) -> Self {
        Self {
            name: name.to_owned(),
            config,
        }
    }
}

impl Stage for PoolStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_shape(&self) -> StreamShape {
        self.config.input_shape()
    }

    fn output_shape(&self) -> StreamShape {
        let c = &self.config;
        StreamShape::square(c.dout(), c.cin, c.ibit as usize)
    }

    fn process_image(
        &self,
        input: &mut dyn ElementSource,
        output: &mut dyn ElementSink,
    ) -> Result<()> {
        let c = &self.config;
        let shape = self.input_shape();
        let bits = c.ibit as usize;
        let mut lines = LineBuffer::new(c.k, c.s, c.din);

        for _ in 0..shape.elements() {
            let element = pull_checked(&self.name, input, shape.element_bits())?;
            if lines.push(element).is_none() {
                continue;
            }
            for ox in 0..c.dout() {
                let x0 = ox * c.s;
                let mut out = BitWord::zero(shape.element_bits());
                for ch in 0..c.cin {
                    let mut max = 0;
                    for kh in 0..c.k {
                        for kw in 0..c.k {
                            max = max.max(lines.at(kh, x0 + kw).get(ch * bits, bits));
                        }
                    }
                    out.set(ch * bits, bits, max);
                }
                output.push(out)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn pool(din: usize, k: usize, s: usize, channels: usize) -> PoolStage {
        PoolStage::new(
            "pool",
            LayerConfig {
                k,
                s,
                din,
                cin: channels,
                cout: channels,
                ibit: 5,
                wbit: 0,
                mbit: 0,
                abit: 5,
                in_p: 1,
                out_p: 1,
            },
        )
    }

    #[test]
    fn test_max_per_channel() {
        let stage = pool(4, 2, 2, 2);
        // ch0 = raster index, ch1 = 31 − index
        let mut src: VecDeque<BitWord> = (0..16u64)
            .map(|i| BitWord::from_fields(5, &[i, 31 - i]))
            .collect();
        let mut out = Vec::new();
        stage.process_image(&mut src, &mut out).unwrap();
        let ch0: Vec<u64> = out.iter().map(|w| w.get(0, 5)).collect();
        let ch1: Vec<u64> = out.iter().map(|w| w.get(5, 5)).collect();
        assert_eq!(ch0, vec![5, 7, 13, 15]);
        assert_eq!(ch1, vec![31, 29, 23, 21]);
    }

    #[test]
    fn test_odd_input_drops_last_row_and_column() {
        let stage = pool(9, 2, 2, 1);
        assert_eq!(stage.output_shape(), StreamShape::square(4, 1, 5));
        let mut src: VecDeque<BitWord> = (0..81u64)
            .map(|i| BitWord::from_u64(5, if i % 9 == 8 || i >= 72 { 31 } else { 1 }))
            .collect();
        let mut out = Vec::new();
        stage.process_image(&mut src, &mut out).unwrap();
        assert_eq!(out.len(), 16);
        assert!(out.iter().all(|w| w.get(0, 5) == 1));
    }
}
