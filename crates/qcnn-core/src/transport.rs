// SPDX-License-Identifier: AGPL-3.0-only

//! Host transport word layout.
//!
//! The host hands the engine fixed 512-bit words. Input words carry one
//! "line" of packed pixels in their low bits; output words carry the class
//! scores of one image starting at bit 0. Reserved high bits are zero.

/// Width of a host transport word.
pub const TRANSPORT_BITS: usize = 512;

/// Bytes per transport word.
pub const TRANSPORT_BYTES: usize = TRANSPORT_BITS / 8;

/// Reference input layout: useful bits per line (56 × 8-bit pixels).
pub const LINE_PAYLOAD_BITS: usize = 448;

/// Reference input layout: lines per 28×28 image (two image rows per line).
pub const LINES_PER_IMAGE: usize = 14;

/// Reference input pixel width.
pub const PIXEL_BITS: usize = 8;

/// Pixels carried by one reference line.
pub const PIXELS_PER_LINE: usize = LINE_PAYLOAD_BITS / PIXEL_BITS;

/// Output words produced per image.
pub const OUTPUT_WORDS_PER_IMAGE: usize = 1;

/// How images are laid out across input transport words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestLayout {
    /// Useful payload bits in the low end of each transport word.
    pub line_bits: usize,
    /// Transport words per image.
    pub lines_per_image: usize,
}

impl IngestLayout {
    /// Reference layout: 14 lines of 448 bits.
    pub const REFERENCE: Self = Self {
        line_bits: LINE_PAYLOAD_BITS,
        lines_per_image: LINES_PER_IMAGE,
    };

    /// Payload bits per image.
    #[must_use]
    pub const fn image_bits(&self) -> usize {
        self.line_bits * self.lines_per_image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_line_geometry() {
        assert_eq!(PIXELS_PER_LINE, 56);
        assert_eq!(PIXELS_PER_LINE * LINES_PER_IMAGE, 28 * 28);
        assert!(LINE_PAYLOAD_BITS <= TRANSPORT_BITS);
        assert_eq!(TRANSPORT_BYTES, 64);
    }
}
