// SPDX-License-Identifier: AGPL-3.0-only

//! Lossless bit-width conversion between word streams.
//!
//! A [`Repacker`] consumes words of `in_width` bits and produces words of
//! `out_width` bits carrying the same payload, LSB-first. Narrowing packs
//! elements back to back with no gaps; widening concatenates. Only
//! [`Repacker::flush`] inserts zero bits, at the very end of the payload.
//!
//! ```text
//! in  (3-bit):  [c b a] [f e d] [i h g]
//! out (4-bit):  [d c b a] [h g f e] [0 0 0 i]   ← flush pads the tail
//! ```
//!
//! The carry buffer never holds more than `in_width + out_width − 1` bits.

use crate::bits::BitWord;

/// Streaming bit-width converter.
#[derive(Debug, Clone)]
pub struct Repacker {
    in_width: usize,
    out_width: usize,
    carry: BitWord,
    fill: usize,
}

impl Repacker {
    /// Create a converter from `in_width`-bit to `out_width`-bit words.
    ///
    /// # Panics
    ///
    /// Panics if either width is zero.
    #[must_use]
    pub fn new(in_width: usize, out_width: usize) -> Self {
        assert!(in_width > 0 && out_width > 0, "repack widths must be non-zero");
        Self {
            in_width,
            out_width,
            carry: BitWord::zero(Self::carry_capacity(in_width, out_width)),
            fill: 0,
        }
    }

    /// Maximum number of bits held between calls.
    #[must_use]
    pub const fn carry_capacity(in_width: usize, out_width: usize) -> usize {
        in_width + out_width - 1
    }

    /// Input word width.
    #[must_use]
    pub const fn in_width(&self) -> usize {
        self.in_width
    }

    /// Output word width.
    #[must_use]
    pub const fn out_width(&self) -> usize {
        self.out_width
    }

    /// Bits currently buffered (always `< out_width` between calls).
    #[must_use]
    pub const fn pending_bits(&self) -> usize {
        self.fill
    }

    /// Append one input word, emitting every output word it completes.
    ///
    /// # Panics
    ///
    /// Panics if `word` is not `in_width` bits wide.
    pub fn push(&mut self, word: &BitWord, mut emit: impl FnMut(BitWord)) {
        assert_eq!(
            word.width(),
            self.in_width,
            "repacker expects {}-bit words",
            self.in_width
        );
        self.carry.insert(self.fill, word);
        self.fill += self.in_width;
        while self.fill >= self.out_width {
            emit(self.carry.extract(0, self.out_width));
            self.carry.shift_down(self.out_width);
            self.fill -= self.out_width;
        }
    }

    /// Emit any buffered residue as one zero-padded output word and reset.
    ///
    /// Returns `true` if a word was emitted.
    pub fn flush(&mut self, mut emit: impl FnMut(BitWord)) -> bool {
        if self.fill == 0 {
            return false;
        }
        emit(self.carry.extract(0, self.fill).resized(self.out_width));
        self.carry.clear();
        self.fill = 0;
        true
    }
}

/// Convert a whole word sequence, zero-padding the final output word.
#[must_use]
pub fn repack(words: &[BitWord], in_width: usize, out_width: usize) -> Vec<BitWord> {
    let mut out = Vec::with_capacity(words.len() * in_width / out_width + 1);
    let mut repacker = Repacker::new(in_width, out_width);
    for word in words {
        repacker.push(word, |w| out.push(w));
    }
    repacker.flush(|w| out.push(w));
    out
}

/// Number of output words `repack` produces for `count` input words.
#[must_use]
pub const fn repacked_len(count: usize, in_width: usize, out_width: usize) -> usize {
    (count * in_width).div_ceil(out_width)
}
