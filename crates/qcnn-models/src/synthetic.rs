// SPDX-License-Identifier: AGPL-3.0-only

//! Deterministic synthetic parameters.
//!
//! Trained parameters are not bundled, so the reference topology can be
//! populated from a seed. The same seed always yields byte-identical blobs,
//! which keeps selftests and benchmarks reproducible across machines.
//!
//! Requantization scales are chosen so that a typical accumulator lands in
//! the middle of the activation range rather than saturating.

use crate::error::Result;
use crate::model::{LayerSpec, Model};
use crate::weights::{value_range, RequantParams, WeightTensor};
use qcnn_core::topology::{FIXED_POINT, REFERENCE_LAYERS};
use qcnn_core::{FixedPoint, IngestLayout, LayerConfig, LayerKind};
use rand::Rng;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

/// Reference MNIST 1W5A network with seeded random parameters.
///
/// # Errors
///
/// Never fails for the built-in topology; the `Result` carries validation
/// of the generated parameters.
pub fn reference_model(seed: u64) -> Result<Model> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let layers = REFERENCE_LAYERS
        .iter()
        .map(|&(name, kind, config)| random_layer(&mut rng, name, kind, config, FIXED_POINT))
        .collect::<Result<Vec<_>>>()?;
    tracing::debug!("Synthesized reference model from seed {seed}");
    Model::new(FIXED_POINT, IngestLayout::REFERENCE, layers)
}

/// Fixed point of [`selftest_model`].
pub const SELFTEST_FIXED: FixedPoint = FixedPoint {
    scale_bits: 0,
    factor_scale_bits: 8,
};

/// 4×4 binary image fed to [`selftest_model`], row-major.
#[rustfmt::skip]
pub const SELFTEST_IMAGE: [u64; 16] = [
    1, 1, 0, 0,
    1, 1, 0, 0,
    0, 0, 1, 1,
    0, 0, 1, 1,
];

/// Scores [`selftest_model`] produces for [`SELFTEST_IMAGE`].
///
/// The all-ones 2×2 conv yields `[4 2 0; 2 2 2; 0 2 4]`; class 0 sums it,
/// class 1 weighs the corners by −2.
pub const SELFTEST_SCORES: [i64; 2] = [18, -6];

/// Two-layer network small enough to score by hand.
///
/// 4×4 1-bit image → 2×2 all-ones conv (3-bit ReLU) → 9 → 2 raw scores,
/// one 16-bit ingest line per image.
///
/// # Errors
///
/// Never fails; the `Result` carries model validation.
pub fn selftest_model() -> Result<Model> {
    let conv = LayerConfig {
        k: 2,
        s: 1,
        din: 4,
        cin: 1,
        cout: 1,
        ibit: 1,
        wbit: 1,
        mbit: 8,
        abit: 3,
        in_p: 1,
        out_p: 1,
    };
    let dense = LayerConfig {
        k: 1,
        s: 1,
        din: 1,
        cin: 9,
        cout: 2,
        ibit: 3,
        wbit: 4,
        mbit: 16,
        abit: 0,
        in_p: 1,
        out_p: 2,
    };
    let mut dense_weights = vec![1i8; 9];
    dense_weights.extend([-2, 1, 1, 1, 1, 1, 1, 1, -2]);
    Model::new(
        SELFTEST_FIXED,
        IngestLayout {
            line_bits: 16,
            lines_per_image: 1,
        },
        vec![
            LayerSpec::conv(
                "conv",
                conv,
                WeightTensor::new(1, vec![1; 4])?,
                RequantParams::identity(1, SELFTEST_FIXED.factor_scale_bits),
            ),
            LayerSpec::dense_no_act("scores", dense, WeightTensor::new(4, dense_weights)?, None),
        ],
    )
}

/// One layer with random weights and activation-spreading factors.
///
/// Terminal dense layers get no requantization factors.
///
/// # Errors
///
/// Returns error if `config` has an unsupported weight width.
pub fn random_layer<R: Rng>(
    rng: &mut R,
    name: &str,
    kind: LayerKind,
    config: LayerConfig,
    fixed: FixedPoint,
) -> Result<LayerSpec> {
    match kind {
        LayerKind::Pool => Ok(LayerSpec::pool(name, config)),
        LayerKind::Conv => Ok(LayerSpec::conv(
            name,
            config,
            random_weights(rng, config.wbit, config.weight_count())?,
            random_requant(rng, &config, fixed),
        )),
        LayerKind::Dense => Ok(LayerSpec::dense(
            name,
            config,
            random_weights(rng, config.wbit, config.weight_count())?,
            random_requant(rng, &config, fixed),
        )),
        LayerKind::DenseNoAct => Ok(LayerSpec::dense_no_act(
            name,
            config,
            random_weights(rng, config.wbit, config.weight_count())?,
            None,
        )),
    }
}

/// `count` uniformly drawn weights of `wbit` bits.
///
/// # Errors
///
/// Returns error if `wbit` is unsupported.
#[allow(clippy::cast_possible_truncation)]
pub fn random_weights<R: Rng>(rng: &mut R, wbit: u32, count: usize) -> Result<WeightTensor> {
    let values = if wbit == 1 {
        (0..count)
            .map(|_| if rng.random_bool(0.5) { 1 } else { -1 })
            .collect()
    } else {
        let (lo, hi) = value_range(wbit.clamp(2, 8));
        (0..count)
            .map(|_| rng.random_range(lo..=hi) as i8)
            .collect()
    };
    WeightTensor::new(wbit, values)
}

/// Per-channel factors mapping the accumulator's typical spread onto the
/// activation range, with a small random bias.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn random_requant<R: Rng>(rng: &mut R, config: &LayerConfig, fixed: FixedPoint) -> RequantParams {
    let one = 1i64 << fixed.factor_scale_bits;
    let act_max = (1i64 << config.abit.min(16)) - 1;
    let in_max = (1i64 << config.ibit.min(16)) - 1;
    // random ±1 sums grow like sqrt(fan_in)
    let spread = ((config.fan_in() as f64).sqrt() * in_max as f64).max(1.0);
    let base = ((one * act_max) as f64 / spread).max(1.0);

    let (factor_a, factor_b) = (0..config.cout)
        .map(|_| {
            let a = base * rng.random_range(0.5..1.5);
            let b = one * act_max / 2 + rng.random_range(-one..=one);
            (
                a.min(f64::from(i32::MAX)) as i32,
                b.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32,
            )
        })
        .unzip();
    RequantParams::from_parts(factor_a, factor_b)
}
