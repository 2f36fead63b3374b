// SPDX-License-Identifier: AGPL-3.0-only

//! Quantized weights and requantization factors.
//!
//! Weights are stored packed, `Wbit` bits each, LSB-first, and decoded once
//! to `i8` when the layer is built. Decoding rules:
//!
//! - `Wbit = 1`: sign-only, bit `1 → +1`, bit `0 → −1`
//! - `Wbit ≥ 2`: two's complement in `Wbit` bits

use crate::error::{ModelError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Largest supported weight width.
pub const MAX_WEIGHT_BITS: u32 = 8;

/// Decoded weight tensor of one layer.
///
/// Row-major: conv `[Cout][Cin][K][K]`, dense `[Dout][Din]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightTensor {
    wbit: u32,
    values: Vec<i8>,
}

impl WeightTensor {
    /// Wrap already-decoded values, checking each fits `wbit`.
    ///
    /// # Errors
    ///
    /// Returns error if `wbit` is unsupported or a value is out of range
    /// (for `wbit = 1` only ±1 are representable).
    pub fn new(wbit: u32, values: Vec<i8>) -> Result<Self> {
        check_wbit(wbit)?;
        let (lo, hi) = value_range(wbit);
        if let Some((i, v)) = values
            .iter()
            .enumerate()
            .find(|(_, &v)| !(lo..=hi).contains(&i32::from(v)) || (wbit == 1 && v == 0))
        {
            return Err(ModelError::bit_width(
                "weights",
                format!("weight[{i}] = {v} not representable in {wbit} bits"),
            ));
        }
        Ok(Self { wbit, values })
    }

    /// Decode `count` packed weights.
    ///
    /// # Errors
    ///
    /// Returns error if `data` is shorter than `packed_len(wbit, count)`.
    pub fn from_packed(wbit: u32, count: usize, data: &[u8]) -> Result<Self> {
        check_wbit(wbit)?;
        let needed = packed_len(wbit, count).ok_or_else(|| {
            ModelError::parse_error(format!("{count} × {wbit}-bit weights overflow the address space"))
        })?;
        if data.len() < needed {
            return Err(ModelError::parse_error(format!(
                "weight block too short: {} < {needed} bytes for {count} × {wbit}-bit",
                data.len()
            )));
        }
        let width = wbit as usize;
        let mut values = Vec::with_capacity(count);
        for i in 0..count {
            let mut raw = 0u32;
            for b in 0..width {
                let pos = i * width + b;
                let bit = (data[pos / 8] >> (pos % 8)) & 1;
                raw |= u32::from(bit) << b;
            }
            values.push(decode_weight(raw, wbit));
        }
        Ok(Self { wbit, values })
    }

    /// Encode to the packed wire form.
    #[must_use]
    pub fn pack(&self) -> Bytes {
        let width = self.wbit as usize;
        let count = self.values.len();
        // in-memory length: (count / 8) · wbit never exceeds count
        let mut buf = BytesMut::zeroed(count / 8 * width + (count % 8 * width).div_ceil(8));
        for (i, &v) in self.values.iter().enumerate() {
            let raw = encode_weight(v, self.wbit);
            for b in 0..width {
                if (raw >> b) & 1 == 1 {
                    let pos = i * width + b;
                    buf[pos / 8] |= 1 << (pos % 8);
                }
            }
        }
        buf.freeze()
    }

    /// Weight width in bits.
    #[must_use]
    pub const fn wbit(&self) -> u32 {
        self.wbit
    }

    /// Number of weights.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the tensor holds no weights.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// All weights, row-major.
    #[must_use]
    pub fn values(&self) -> &[i8] {
        &self.values
    }

    /// Weights of output channel `row` for a fan-in of `fan_in`.
    #[must_use]
    pub fn row(&self, row: usize, fan_in: usize) -> &[i8] {
        &self.values[row * fan_in..(row + 1) * fan_in]
    }
}

/// Per-output-channel affine requantization factors.
///
/// Both factors are fixed-point with `FACTOR_SCALE_BITS` fractional bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequantParams {
    factor_a: Vec<i32>,
    factor_b: Vec<i32>,
}

impl RequantParams {
    /// Build from scale and shift vectors.
    ///
    /// # Errors
    ///
    /// Returns error if the vectors differ in length.
    pub fn new(factor_a: Vec<i32>, factor_b: Vec<i32>) -> Result<Self> {
        if factor_a.len() != factor_b.len() {
            return Err(ModelError::weight_shape(
                "requant",
                "factorB",
                factor_a.len(),
                factor_b.len(),
            ));
        }
        Ok(Self { factor_a, factor_b })
    }

    pub(crate) fn from_parts(factor_a: Vec<i32>, factor_b: Vec<i32>) -> Self {
        debug_assert_eq!(factor_a.len(), factor_b.len());
        Self { factor_a, factor_b }
    }

    /// Unit scale, zero shift: `q = acc`.
    #[must_use]
    pub fn identity(channels: usize, factor_scale_bits: u32) -> Self {
        Self {
            factor_a: vec![1 << factor_scale_bits; channels],
            factor_b: vec![0; channels],
        }
    }

    /// Number of channels covered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.factor_a.len()
    }

    /// True if no channels are covered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factor_a.is_empty()
    }

    /// Scale factors.
    #[must_use]
    pub fn factor_a(&self) -> &[i32] {
        &self.factor_a
    }

    /// Shift factors.
    #[must_use]
    pub fn factor_b(&self) -> &[i32] {
        &self.factor_b
    }

    /// `(factorA, factorB)` of one channel.
    #[must_use]
    pub fn channel(&self, c: usize) -> (i32, i32) {
        (self.factor_a[c], self.factor_b[c])
    }

    /// Append as little-endian i32: all of factorA, then all of factorB.
    pub fn write_le(&self, buf: &mut BytesMut) {
        for &a in &self.factor_a {
            buf.put_i32_le(a);
        }
        for &b in &self.factor_b {
            buf.put_i32_le(b);
        }
    }
}

/// Bytes needed for `count` packed weights of `wbit` bits, or `None` if
/// that does not fit `usize`.
#[must_use]
pub const fn packed_len(wbit: u32, count: usize) -> Option<usize> {
    let width = wbit as usize;
    let Some(whole) = (count / 8).checked_mul(width) else {
        return None;
    };
    whole.checked_add((count % 8 * width).div_ceil(8))
}

/// Inclusive value range of a `wbit`-bit weight.
#[must_use]
pub const fn value_range(wbit: u32) -> (i32, i32) {
    if wbit == 1 {
        (-1, 1)
    } else {
        (-(1 << (wbit - 1)), (1 << (wbit - 1)) - 1)
    }
}

fn check_wbit(wbit: u32) -> Result<()> {
    if wbit == 0 || wbit > MAX_WEIGHT_BITS {
        return Err(ModelError::bit_width(
            "weights",
            format!("Wbit={wbit} outside 1..={MAX_WEIGHT_BITS}"),
        ));
    }
    Ok(())
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn decode_weight(raw: u32, wbit: u32) -> i8 {
    if wbit == 1 {
        if raw & 1 == 1 {
            1
        } else {
            -1
        }
    } else {
        let shift = 32 - wbit;
        (((raw << shift) as i32) >> shift) as i8
    }
}

#[allow(clippy::cast_sign_loss)]
fn encode_weight(v: i8, wbit: u32) -> u32 {
    if wbit == 1 {
        u32::from(v > 0)
    } else {
        (i32::from(v) as u32) & ((1 << wbit) - 1)
    }
}
