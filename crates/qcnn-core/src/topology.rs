// SPDX-License-Identifier: AGPL-3.0-only

//! Reference network: MNIST classifier, 1-bit weights, 5-bit activations.
//!
//! ```text
//! 28×28×1 @8b ─conv0─▶ 26×26×16 @5b ─pool0─▶ 13×13×16
//!   ─conv1─▶ 11×11×32 ─conv2─▶ 9×9×32 ─pool1─▶ 4×4×32
//!   ─conv3─▶ 2×2×64 ─dense0─▶ 128 @5b ─dense1─▶ 10 × 24-bit scores
//! ```

use crate::layer::{FixedPoint, LayerConfig, LayerKind};

/// Fractional bits of each class score.
pub const SCALE_BITS: u32 = 4;

/// Fractional bits of the requantization factors.
pub const FACTOR_SCALE_BITS: u32 = 16;

/// Fixed-point widths of the reference network.
pub const FIXED_POINT: FixedPoint = FixedPoint {
    scale_bits: SCALE_BITS,
    factor_scale_bits: FACTOR_SCALE_BITS,
};

const fn conv(
    din: usize,
    cin: usize,
    cout: usize,
    ibit: u32,
    in_p: usize,
    out_p: usize,
) -> LayerConfig {
    LayerConfig {
        k: 3,
        s: 1,
        din,
        cin,
        cout,
        ibit,
        wbit: 1,
        mbit: 16,
        abit: 5,
        in_p,
        out_p,
    }
}

const fn pool(din: usize, channels: usize) -> LayerConfig {
    LayerConfig {
        k: 2,
        s: 2,
        din,
        cin: channels,
        cout: channels,
        ibit: 5,
        wbit: 0,
        mbit: 0,
        abit: 5,
        in_p: 1,
        out_p: 1,
    }
}

const fn dense(inputs: usize, outputs: usize, mbit: u32, in_p: usize, out_p: usize) -> LayerConfig {
    LayerConfig {
        k: 1,
        s: 1,
        din: 1,
        cin: inputs,
        cout: outputs,
        ibit: 5,
        wbit: 1,
        mbit,
        abit: 5,
        in_p,
        out_p,
    }
}

/// conv0: 28×28×1 → 26×26×16.
pub const CONV0: LayerConfig = conv(28, 1, 16, 8, 1, 16);
/// pool0: 26×26×16 → 13×13×16.
pub const POOL0: LayerConfig = pool(26, 16);
/// conv1: 13×13×16 → 11×11×32.
pub const CONV1: LayerConfig = conv(13, 16, 32, 5, 16, 32);
/// conv2: 11×11×32 → 9×9×32.
pub const CONV2: LayerConfig = conv(11, 32, 32, 5, 32, 32);
/// pool1: 9×9×32 → 4×4×32.
pub const POOL1: LayerConfig = pool(9, 32);
/// conv3: 4×4×32 → 2×2×64.
pub const CONV3: LayerConfig = conv(4, 32, 64, 5, 32, 64);
/// dense0: 256 → 128, 5-bit activations.
pub const DENSE0: LayerConfig = dense(256, 128, 16, 64, 32);
/// dense1: 128 → 10 raw 24-bit scores.
pub const DENSE1: LayerConfig = dense(128, 10, 24, 32, 10);

/// Number of output classes.
pub const NUM_CLASSES: usize = DENSE1.cout;

/// The reference chain in execution order.
pub const REFERENCE_LAYERS: [(&str, LayerKind, LayerConfig); 8] = [
    ("conv0", LayerKind::Conv, CONV0),
    ("pool0", LayerKind::Pool, POOL0),
    ("conv1", LayerKind::Conv, CONV1),
    ("conv2", LayerKind::Conv, CONV2),
    ("pool1", LayerKind::Pool, POOL1),
    ("conv3", LayerKind::Conv, CONV3),
    ("dense0", LayerKind::Dense, DENSE0),
    ("dense1", LayerKind::DenseNoAct, DENSE1),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{IngestLayout, TRANSPORT_BITS};

    #[test]
    fn spatial_chain_is_consistent() {
        assert_eq!(CONV0.dout(), POOL0.din);
        assert_eq!(POOL0.dout(), CONV1.din);
        assert_eq!(CONV1.dout(), CONV2.din);
        assert_eq!(CONV2.dout(), POOL1.din);
        assert_eq!(POOL1.dout(), CONV3.din);
        assert_eq!(CONV3.dout() * CONV3.dout() * CONV3.cout, DENSE0.cin);
        assert_eq!(DENSE0.cout, DENSE1.cin);
    }

    #[test]
    fn accumulators_have_headroom() {
        for (name, kind, cfg) in REFERENCE_LAYERS {
            if kind.has_weights() {
                assert!(cfg.accumulator_headroom() >= 0, "{name} overflows");
            }
        }
        assert!(DENSE1.mbit >= DENSE1.required_accumulator_bits() + SCALE_BITS);
    }

    #[test]
    fn ingest_matches_first_layer() {
        assert_eq!(
            IngestLayout::REFERENCE.image_bits(),
            CONV0.input_shape().image_bits()
        );
    }

    #[test]
    fn scores_fit_one_transport_word() {
        assert!(NUM_CLASSES * DENSE1.mbit as usize <= TRANSPORT_BITS);
    }
}
