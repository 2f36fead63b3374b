// SPDX-License-Identifier: AGPL-3.0-only

//! Sliding K-row line buffer for strided window stages.
//!
//! Input elements arrive in raster order. The buffer keeps only the last
//! `k` complete rows, so an output row can be produced as soon as the last
//! input row of its window is in. Rows skipped by a stride larger than the
//! kernel simply age out.

use qcnn_core::BitWord;
use std::collections::VecDeque;

/// Line buffer over one image.
#[derive(Debug)]
pub struct LineBuffer {
    k: usize,
    s: usize,
    din: usize,
    rows: VecDeque<Vec<BitWord>>,
    current: Vec<BitWord>,
    rows_seen: usize,
}

impl LineBuffer {
    /// Buffer for a `k × k`, stride `s` window over a `din × din` grid.
    pub fn new(k: usize, s: usize, din: usize) -> Self {
        Self {
            k,
            s,
            din,
            rows: VecDeque::with_capacity(k + 1),
            current: Vec::with_capacity(din),
            rows_seen: 0,
        }
    }

    /// Append one element. Returns the output row index when this element
    /// completes the bottom row of a window row.
    pub fn push(&mut self, element: BitWord) -> Option<usize> {
        self.current.push(element);
        if self.current.len() < self.din {
            return None;
        }
        let row = std::mem::replace(&mut self.current, Vec::with_capacity(self.din));
        self.rows.push_back(row);
        if self.rows.len() > self.k {
            self.rows.pop_front();
        }
        let r = self.rows_seen;
        self.rows_seen += 1;
        if r + 1 >= self.k && (r + 1 - self.k) % self.s == 0 {
            Some((r + 1 - self.k) / self.s)
        } else {
            None
        }
    }

    /// Element at window row `kh`, input column `col`.
    pub fn at(&self, kh: usize, col: usize) -> &BitWord {
        &self.rows[kh][col]
    }

    /// Gather the window starting at output column `ox` as
    /// `[channel][kh][kw]` values of `bits` bits.
    pub fn gather(&self, ox: usize, channels: usize, bits: usize, out: &mut Vec<i64>) {
        out.clear();
        let x0 = ox * self.s;
        for c in 0..channels {
            for kh in 0..self.k {
                for kw in 0..self.k {
                    #[allow(clippy::cast_possible_wrap)]
                    out.push(self.at(kh, x0 + kw).get(c * bits, bits) as i64);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(buf: &mut LineBuffer, din: usize) -> Vec<(usize, usize)> {
        let mut ready = Vec::new();
        for i in 0..din * din {
            if let Some(row) = buf.push(BitWord::from_u64(8, i as u64)) {
                ready.push((i / din, row));
            }
        }
        ready
    }

    #[test]
    fn test_rows_released_as_soon_as_complete() {
        let mut buf = LineBuffer::new(3, 1, 5);
        assert_eq!(feed(&mut buf, 5), vec![(2, 0), (3, 1), (4, 2)]);
    }

    #[test]
    fn test_stride_skips_rows() {
        let mut buf = LineBuffer::new(2, 2, 9);
        let ready = feed(&mut buf, 9);
        // 9 rows, pool 2×2/2 → 4 output rows, last input row unused
        assert_eq!(ready, vec![(1, 0), (3, 1), (5, 2), (7, 3)]);
    }

    #[test]
    fn test_stride_larger_than_kernel() {
        let mut buf = LineBuffer::new(1, 3, 7);
        let rows: Vec<usize> = feed(&mut buf, 7).into_iter().map(|(_, r)| r).collect();
        assert_eq!(rows, vec![0, 1, 2]);
    }

    #[test]
    fn test_gather_order() {
        let mut buf = LineBuffer::new(2, 1, 3);
        let mut last = None;
        for i in 0..6u64 {
            // two 4-bit channels: c0 = i, c1 = 10 + i
            let w = BitWord::from_fields(4, &[i, 10 + i]);
            last = buf.push(w).or(last);
        }
        assert_eq!(last, Some(0));
        let mut out = Vec::new();
        buf.gather(1, 2, 4, &mut out);
        assert_eq!(out, vec![1, 2, 4, 5, 11, 12, 14, 15]);
    }
}
