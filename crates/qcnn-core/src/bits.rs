// SPDX-License-Identifier: AGPL-3.0-only

//! Fixed-width bit buffer.
//!
//! Every element flowing between stages is a [`BitWord`]: an unsigned bit
//! vector of a width fixed at construction. Bit 0 is the least significant
//! bit; multi-field payloads are laid out LSB-first (field 0 at bit 0).
//!
//! Range arguments are checked with assertions. An out-of-range access is a
//! stage wiring bug, not a data-dependent condition.

use std::fmt;

const LIMB_BITS: usize = 64;

/// Mask with the low `len` bits set (`len` ≤ 64).
#[must_use]
pub const fn low_mask(len: usize) -> u64 {
    if len >= LIMB_BITS {
        u64::MAX
    } else {
        (1u64 << len) - 1
    }
}

/// Sign-extend the low `len` bits of `value` (`1 ≤ len ≤ 64`).
#[must_use]
pub const fn sign_extend(value: u64, len: usize) -> i64 {
    let shift = LIMB_BITS - len;
    ((value << shift) as i64) >> shift
}

/// Unsigned bit vector of fixed width.
///
/// Invariant: bits at positions `≥ width` are always zero.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BitWord {
    width: usize,
    limbs: Vec<u64>,
}

impl BitWord {
    /// All-zero word of `width` bits.
    #[must_use]
    pub fn zero(width: usize) -> Self {
        Self {
            width,
            limbs: vec![0; width.div_ceil(LIMB_BITS)],
        }
    }

    /// Word of `width` bits holding `value` in its low bits.
    ///
    /// # Panics
    ///
    /// Panics if `value` does not fit in `width` bits.
    #[must_use]
    pub fn from_u64(width: usize, value: u64) -> Self {
        assert!(
            width >= LIMB_BITS || value >> width == 0,
            "value {value:#x} does not fit in {width} bits"
        );
        let mut word = Self::zero(width);
        if let Some(limb) = word.limbs.first_mut() {
            *limb = value;
        }
        word
    }

    /// Build a word from little-endian bytes (byte 0 holds bits 0..8).
    ///
    /// Bytes beyond `width` must be zero, extra high bits are cleared.
    #[must_use]
    pub fn from_le_bytes(width: usize, bytes: &[u8]) -> Self {
        let mut word = Self::zero(width);
        for (i, &byte) in bytes.iter().enumerate().take(width.div_ceil(8)) {
            word.limbs[i / 8] |= u64::from(byte) << ((i % 8) * 8);
        }
        word.clear_above_width();
        word
    }

    /// Serialize to `ceil(width / 8)` little-endian bytes.
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        (0..self.width.div_ceil(8))
            .map(|i| (self.limbs[i / 8] >> ((i % 8) * 8)) as u8)
            .collect()
    }

    /// Width in bits.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    /// True if every bit is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.limbs.iter().all(|&l| l == 0)
    }

    /// Number of set bits.
    #[must_use]
    pub fn count_ones(&self) -> u32 {
        self.limbs.iter().map(|l| l.count_ones()).sum()
    }

    /// Read the `len`-bit field starting at bit `lo` (`len` ≤ 64).
    ///
    /// # Panics
    ///
    /// Panics if the field exceeds the word or `len > 64`.
    #[must_use]
    pub fn get(&self, lo: usize, len: usize) -> u64 {
        self.check_range(lo, len);
        if len == 0 {
            return 0;
        }
        let idx = lo / LIMB_BITS;
        let off = lo % LIMB_BITS;
        let mut value = self.limbs[idx] >> off;
        if off != 0 && off + len > LIMB_BITS {
            value |= self.limbs[idx + 1] << (LIMB_BITS - off);
        }
        value & low_mask(len)
    }

    /// Read the `len`-bit field at `lo` as a two's complement integer.
    #[must_use]
    pub fn get_signed(&self, lo: usize, len: usize) -> i64 {
        if len == 0 {
            return 0;
        }
        sign_extend(self.get(lo, len), len)
    }

    /// Write the low `len` bits of `value` into the field at `lo`.
    ///
    /// Higher bits of `value` are ignored.
    ///
    /// # Panics
    ///
    /// Panics if the field exceeds the word or `len > 64`.
    pub fn set(&mut self, lo: usize, len: usize, value: u64) {
        self.check_range(lo, len);
        if len == 0 {
            return;
        }
        let value = value & low_mask(len);
        let idx = lo / LIMB_BITS;
        let off = lo % LIMB_BITS;
        self.limbs[idx] &= !(low_mask(len) << off);
        self.limbs[idx] |= value << off;
        if off + len > LIMB_BITS {
            let spill = off + len - LIMB_BITS;
            self.limbs[idx + 1] &= !low_mask(spill);
            self.limbs[idx + 1] |= value >> (LIMB_BITS - off);
        }
    }

    /// Copy `len` bits starting at `lo` into a new word of width `len`.
    #[must_use]
    pub fn extract(&self, lo: usize, len: usize) -> Self {
        assert!(
            lo + len <= self.width,
            "extract [{lo}, {}) out of range for {}-bit word",
            lo + len,
            self.width
        );
        let mut out = Self::zero(len);
        let mut done = 0;
        while done < len {
            let chunk = (len - done).min(LIMB_BITS);
            out.set(done, chunk, self.get(lo + done, chunk));
            done += chunk;
        }
        out
    }

    /// Overwrite the bits starting at `lo` with the whole of `src`.
    pub fn insert(&mut self, lo: usize, src: &Self) {
        assert!(
            lo + src.width <= self.width,
            "insert of {} bits at {lo} overflows {}-bit word",
            src.width,
            self.width
        );
        let mut done = 0;
        while done < src.width {
            let chunk = (src.width - done).min(LIMB_BITS);
            self.set(lo + done, chunk, src.get(done, chunk));
            done += chunk;
        }
    }

    /// Change the width, zero-extending or truncating the high end.
    #[must_use]
    pub fn resized(mut self, width: usize) -> Self {
        self.limbs.resize(width.div_ceil(LIMB_BITS), 0);
        self.width = width;
        self.clear_above_width();
        self
    }

    /// Shift every bit `n` places toward bit 0, zero-filling the top.
    pub fn shift_down(&mut self, n: usize) {
        if n >= self.width {
            self.clear();
            return;
        }
        let skip = n / LIMB_BITS;
        let off = n % LIMB_BITS;
        for i in 0..self.limbs.len() {
            let lo = self.limbs.get(i + skip).copied().unwrap_or(0);
            let hi = self.limbs.get(i + skip + 1).copied().unwrap_or(0);
            self.limbs[i] = if off == 0 {
                lo
            } else {
                (lo >> off) | (hi << (LIMB_BITS - off))
            };
        }
    }

    /// Zero every bit, keeping the width.
    pub fn clear(&mut self) {
        self.limbs.fill(0);
    }

    /// Iterate over `count` consecutive `len`-bit fields starting at bit 0.
    pub fn fields(&self, len: usize, count: usize) -> impl Iterator<Item = u64> + '_ {
        (0..count).map(move |i| self.get(i * len, len))
    }

    /// Pack `values` as consecutive `len`-bit fields into a new word.
    #[must_use]
    pub fn from_fields(len: usize, values: &[u64]) -> Self {
        let mut word = Self::zero(len * values.len());
        for (i, &v) in values.iter().enumerate() {
            word.set(i * len, len, v);
        }
        word
    }

    fn check_range(&self, lo: usize, len: usize) {
        assert!(len <= LIMB_BITS, "field of {len} bits exceeds 64");
        assert!(
            lo + len <= self.width,
            "field [{lo}, {}) out of range for {}-bit word",
            lo + len,
            self.width
        );
    }

    fn clear_above_width(&mut self) {
        let tail = self.width % LIMB_BITS;
        if tail != 0 {
            if let Some(last) = self.limbs.last_mut() {
                *last &= low_mask(tail);
            }
        }
    }
}

impl fmt::LowerHex for BitWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.width.div_ceil(4).max(1);
        for d in (0..digits).rev() {
            let lo = d * 4;
            let len = (self.width - lo).min(4);
            write!(f, "{:x}", self.get(lo, len))?;
        }
        Ok(())
    }
}

impl fmt::Debug for BitWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BitWord<{}>(0x{:x})", self.width, self)
    }
}
