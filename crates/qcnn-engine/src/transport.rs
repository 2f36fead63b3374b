// SPDX-License-Identifier: AGPL-3.0-only

//! Host-side helpers for the transport word contracts.
//!
//! - Input: `lines_per_image` 512-bit words per image, pixels packed
//!   LSB-first in the low `line_bits`, high bits zero.
//! - Output: one 512-bit word per image, `Dout` signed `Mbit` scores from
//!   bit 0, high bits zero.
//!
//! Files of transport words are raw 64-byte little-endian records.

use crate::error::{EngineError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use qcnn_core::transport::TRANSPORT_BYTES;
use qcnn_core::{BitWord, IngestLayout, TRANSPORT_BITS};
use std::fs;
use std::path::Path;

/// Where the class scores sit in an output word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreLayout {
    /// Number of scores
    pub classes: usize,
    /// Bits per score
    pub bits: usize,
    /// Fractional bits of each score
    pub scale_bits: u32,
}

impl ScoreLayout {
    /// Decode every score of one output word.
    pub fn decode(&self, word: &BitWord) -> Vec<i64> {
        decode_scores(word, self.classes, self.bits)
    }
}

/// Pack one image of `bits`-wide samples into transport words.
///
/// # Errors
///
/// Returns error if the sample count does not fill the layout exactly or a
/// sample does not fit `bits`.
pub fn pack_image_lines(samples: &[u64], bits: usize, layout: IngestLayout) -> Result<Vec<BitWord>> {
    if samples.len() * bits != layout.image_bits() {
        return Err(EngineError::payload_width(
            "input",
            format!(
                "{} samples × {bits} bits does not fill {} lines × {} bits",
                samples.len(),
                layout.lines_per_image,
                layout.line_bits
            ),
        ));
    }
    if layout.line_bits > TRANSPORT_BITS {
        return Err(EngineError::payload_width(
            "input",
            format!("line payload {} exceeds {TRANSPORT_BITS} bits", layout.line_bits),
        ));
    }
    if let Some(v) = samples.iter().find(|&&v| bits < 64 && v >> bits != 0) {
        return Err(EngineError::payload_width(
            "input",
            format!("sample {v} does not fit {bits} bits"),
        ));
    }
    let image = BitWord::from_fields(bits, samples);
    Ok((0..layout.lines_per_image)
        .map(|line| {
            image
                .extract(line * layout.line_bits, layout.line_bits)
                .resized(TRANSPORT_BITS)
        })
        .collect())
}

/// Pack 8-bit pixels of several images back to back.
///
/// # Errors
///
/// Returns error if any image does not match the layout.
pub fn pack_pixel_batch(images: &[&[u8]], layout: IngestLayout) -> Result<Vec<BitWord>> {
    let mut words = Vec::with_capacity(images.len() * layout.lines_per_image);
    for image in images {
        let samples: Vec<u64> = image.iter().map(|&p| u64::from(p)).collect();
        words.extend(pack_image_lines(&samples, 8, layout)?);
    }
    Ok(words)
}

/// Signed scores from the low `classes · bits` bits of `word`.
pub fn decode_scores(word: &BitWord, classes: usize, bits: usize) -> Vec<i64> {
    (0..classes).map(|c| word.get_signed(c * bits, bits)).collect()
}

/// Index of the largest score; the first one wins on ties.
pub fn argmax(scores: &[i64]) -> Option<usize> {
    let mut best: Option<(usize, i64)> = None;
    for (i, &s) in scores.iter().enumerate() {
        if best.map_or(true, |(_, b)| s > b) {
            best = Some((i, s));
        }
    }
    best.map(|(i, _)| i)
}

/// Serialize transport words as 64-byte little-endian records.
pub fn words_to_bytes(words: &[BitWord]) -> Bytes {
    let mut buf = BytesMut::with_capacity(words.len() * TRANSPORT_BYTES);
    for w in words {
        let mut record = w.to_le_bytes();
        record.resize(TRANSPORT_BYTES, 0);
        buf.put_slice(&record[..TRANSPORT_BYTES]);
    }
    buf.freeze()
}

/// Parse 64-byte little-endian records into transport words.
///
/// # Errors
///
/// Returns error if the length is not a whole number of records.
pub fn words_from_bytes(data: &[u8]) -> Result<Vec<BitWord>> {
    if data.len() % TRANSPORT_BYTES != 0 {
        return Err(EngineError::payload_width(
            "input",
            format!(
                "{} bytes is not a whole number of {TRANSPORT_BYTES}-byte words",
                data.len()
            ),
        ));
    }
    Ok(data
        .chunks_exact(TRANSPORT_BYTES)
        .map(|chunk| BitWord::from_le_bytes(TRANSPORT_BITS, chunk))
        .collect())
}

/// Read a file of transport words.
///
/// # Errors
///
/// Returns error if the file cannot be read or is malformed.
pub fn read_words<P: AsRef<Path>>(path: P) -> Result<Vec<BitWord>> {
    let data = fs::read(path.as_ref())?;
    tracing::debug!("Read {} bytes from {}", data.len(), path.as_ref().display());
    words_from_bytes(&data)
}

/// Write transport words to a file.
///
/// # Errors
///
/// Returns error if the file cannot be written.
pub fn write_words<P: AsRef<Path>>(path: P, words: &[BitWord]) -> Result<()> {
    fs::write(path.as_ref(), words_to_bytes(words))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_reference_image() {
        let pixels: Vec<u64> = (0..784).map(|i| i % 256).collect();
        let words = pack_image_lines(&pixels, 8, IngestLayout::REFERENCE).unwrap();
        assert_eq!(words.len(), 14);
        // line 1 starts at pixel 56
        assert_eq!(words[1].get(0, 8), 56);
        // reserved high bits stay zero
        assert!(words.iter().all(|w| w.extract(448, 64).is_zero()));
    }

    #[test]
    fn test_pack_rejects_wrong_count() {
        assert!(pack_image_lines(&[1, 2, 3], 8, IngestLayout::REFERENCE).is_err());
        let layout = IngestLayout {
            line_bits: 8,
            lines_per_image: 1,
        };
        assert!(pack_image_lines(&[300], 8, layout).is_err());
    }

    #[test]
    fn test_decode_signed_scores() {
        let mut w = BitWord::zero(TRANSPORT_BITS);
        w.set(0, 24, (-3i64) as u64);
        w.set(24, 24, 1000);
        assert_eq!(decode_scores(&w, 2, 24), vec![-3, 1000]);
    }

    #[test]
    fn test_argmax_first_max_wins() {
        assert_eq!(argmax(&[1, 5, 5, -2]), Some(1));
        assert_eq!(argmax(&[-7]), Some(0));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_byte_records() {
        let mut w = BitWord::zero(TRANSPORT_BITS);
        w.set(500, 12, 0xabc);
        let bytes = words_to_bytes(&[w.clone(), BitWord::zero(TRANSPORT_BITS)]);
        assert_eq!(bytes.len(), 128);
        let back = words_from_bytes(&bytes).unwrap();
        assert_eq!(back[0], w);
        assert!(words_from_bytes(&bytes[..100]).is_err());
    }
}
