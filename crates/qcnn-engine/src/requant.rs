// SPDX-License-Identifier: AGPL-3.0-only

//! Affine requantization and quantized activation.
//!
//! ```text
//! scaled = acc · factorA[c] + factorB[c]            (FACTOR_SCALE_BITS fraction)
//!
//! activation, Abit ≥ 2:  clamp(scaled >> FACTOR_SCALE_BITS, 0, 2^Abit − 1)
//! activation, Abit = 1:  scaled > 0 ? 1 : 0
//! raw score:             scaled >> (FACTOR_SCALE_BITS − SCALE_BITS)
//!                        or acc << SCALE_BITS without factors,
//!                        wrapped to Mbit two's complement
//! ```
//!
//! Products are formed in `i128`, so no factor/accumulator combination
//! can overflow before the shift.

use qcnn_core::bits::{low_mask, sign_extend};
use qcnn_core::FixedPoint;
use qcnn_models::RequantParams;

/// How accumulators become output fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputRule {
    /// Requantize then apply the quantized activation of `abit` bits.
    Activation {
        /// Output field width
        abit: u32,
    },
    /// Raw signed class score of `mbit` bits with `SCALE_BITS` fraction.
    Score {
        /// Output field width
        mbit: u32,
    },
}

impl OutputRule {
    /// Width of each output field.
    pub const fn width(&self) -> u32 {
        match self {
            Self::Activation { abit } => *abit,
            Self::Score { mbit } => *mbit,
        }
    }
}

/// Per-layer accumulator → field mapping.
#[derive(Debug, Clone)]
pub struct Requantizer {
    rule: OutputRule,
    factors: Option<RequantParams>,
    fixed: FixedPoint,
}

impl Requantizer {
    /// Build for one layer. Activation layers always carry factors.
    pub fn new(rule: OutputRule, factors: Option<RequantParams>, fixed: FixedPoint) -> Self {
        Self {
            rule,
            factors,
            fixed,
        }
    }

    /// Output rule.
    pub const fn rule(&self) -> OutputRule {
        self.rule
    }

    /// Output field of channel `c` for accumulator `acc`, as the low
    /// `width()` bits of the returned value.
    pub fn apply(&self, c: usize, acc: i64) -> u64 {
        let factors = self.factors.as_ref().map(|f| f.channel(c));
        match self.rule {
            OutputRule::Activation { abit } => {
                let fsb = self.fixed.factor_scale_bits;
                let scaled = match factors {
                    Some((a, b)) => affine(acc, a, b),
                    None => i128::from(acc) << fsb,
                };
                quantize(scaled, fsb, abit)
            }
            OutputRule::Score { mbit } => {
                #[allow(clippy::cast_sign_loss)]
                let raw = score(acc, factors, self.fixed, mbit) as u64;
                raw & low_mask(mbit as usize)
            }
        }
    }
}

/// `acc · factorA + factorB`.
pub fn affine(acc: i64, factor_a: i32, factor_b: i32) -> i128 {
    i128::from(acc) * i128::from(factor_a) + i128::from(factor_b)
}

/// Requantize and activate one accumulator.
pub fn activate(acc: i64, factor_a: i32, factor_b: i32, factor_scale_bits: u32, abit: u32) -> u64 {
    quantize(affine(acc, factor_a, factor_b), factor_scale_bits, abit)
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn quantize(scaled: i128, factor_scale_bits: u32, abit: u32) -> u64 {
    if abit == 1 {
        return u64::from(scaled > 0);
    }
    let q = scaled >> factor_scale_bits;
    let max = i128::from(low_mask(abit as usize));
    q.clamp(0, max) as u64
}

/// Raw terminal score, wrapped to `mbit` signed bits.
///
/// Validated models bound the score range, so the wrap only shows up for
/// hand-built requantizers.
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
pub fn score(acc: i64, factors: Option<(i32, i32)>, fixed: FixedPoint, mbit: u32) -> i64 {
    let wide = match factors {
        Some((a, b)) => affine(acc, a, b) >> (fixed.factor_scale_bits - fixed.scale_bits),
        None => i128::from(acc) << fixed.scale_bits,
    };
    let bits = mbit as usize;
    sign_extend(wide as u64 & low_mask(bits), bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXED: FixedPoint = FixedPoint {
        scale_bits: 4,
        factor_scale_bits: 16,
    };

    #[test]
    fn test_relu_saturates() {
        let one = 1 << 16;
        assert_eq!(activate(7, one, 0, 16, 5), 7);
        assert_eq!(activate(40, one, 0, 16, 5), 31);
        assert_eq!(activate(-3, one, 0, 16, 5), 0);
        // half scale, floor
        assert_eq!(activate(9, one / 2, 0, 16, 5), 4);
        // negative scale with positive shift
        assert_eq!(activate(2, -one, 5 * one, 16, 5), 3);
    }

    #[test]
    fn test_binary_step() {
        let one = 1 << 16;
        assert_eq!(activate(0, one, 0, 16, 1), 0);
        assert_eq!(activate(1, one, 0, 16, 1), 1);
        assert_eq!(activate(-1, one, 0, 16, 1), 0);
        assert_eq!(activate(0, one, 1, 16, 1), 1);
    }

    #[test]
    fn test_zero_maps_to_zero() {
        for abit in 1..=16 {
            assert_eq!(activate(0, 12_345, 0, 16, abit), 0);
        }
    }

    #[test]
    fn test_score_without_factors() {
        assert_eq!(score(-5, None, FIXED, 24), -80);
        assert_eq!(score(100, None, FIXED, 24), 1600);
    }

    #[test]
    fn test_score_with_factors_keeps_scale_fraction() {
        // acc · 1.0 → acc · 2^SCALE_BITS
        assert_eq!(score(3, Some((1 << 16, 0)), FIXED, 24), 48);
        // acc · 0.5 + 0.25
        assert_eq!(score(3, Some((1 << 15, 1 << 14)), FIXED, 24), 28);
    }

    #[test]
    fn test_score_wraps_to_mbit() {
        assert_eq!(score(8, None, FixedPoint { scale_bits: 0, factor_scale_bits: 0 }, 4), -8);
    }

    #[test]
    fn test_requantizer_masks_negative_scores() {
        let r = Requantizer::new(OutputRule::Score { mbit: 8 }, None, FIXED);
        assert_eq!(r.apply(0, -1), 0xf0);
        assert_eq!(r.rule().width(), 8);
    }

    #[test]
    fn test_requantizer_uses_channel_factors() {
        let params = RequantParams::new(vec![1 << 16, 2 << 16], vec![0, 0]).unwrap();
        let r = Requantizer::new(OutputRule::Activation { abit: 4 }, Some(params), FIXED);
        assert_eq!(r.apply(0, 3), 3);
        assert_eq!(r.apply(1, 3), 6);
        assert_eq!(r.apply(1, 9), 15);
    }
}
