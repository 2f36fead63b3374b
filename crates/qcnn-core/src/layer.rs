// SPDX-License-Identifier: AGPL-3.0-only

//! Layer geometry and stream shapes.
//!
//! Pure arithmetic over the per-layer constants. Validation with error
//! reporting lives in `qcnn-models`; this module only answers questions
//! such as "how many positions does this layer emit" and "how wide must the
//! accumulator be".

use std::fmt;

/// Processing stage kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    /// 2D convolution + requantization + quantized activation.
    Conv,
    /// Spatial max pooling (channels and widths preserved).
    Pool,
    /// Fully connected + requantization + quantized activation.
    Dense,
    /// Fully connected producing raw signed class scores.
    DenseNoAct,
}

impl LayerKind {
    /// Wire tag used by the model blob format.
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Conv => 0,
            Self::Pool => 1,
            Self::Dense => 2,
            Self::DenseNoAct => 3,
        }
    }

    /// Inverse of [`LayerKind::tag`].
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Conv),
            1 => Some(Self::Pool),
            2 => Some(Self::Dense),
            3 => Some(Self::DenseNoAct),
            _ => None,
        }
    }

    /// Whether the layer carries a weight tensor.
    #[must_use]
    pub const fn has_weights(&self) -> bool {
        !matches!(self, Self::Pool)
    }

    /// Whether the layer applies a quantized activation.
    #[must_use]
    pub const fn has_activation(&self) -> bool {
        matches!(self, Self::Conv | Self::Dense)
    }

    /// Whether the layer consumes its whole input as one flat vector.
    #[must_use]
    pub const fn is_dense(&self) -> bool {
        matches!(self, Self::Dense | Self::DenseNoAct)
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conv => write!(f, "Conv2D"),
            Self::Pool => write!(f, "MaxPool2D"),
            Self::Dense => write!(f, "Dense"),
            Self::DenseNoAct => write!(f, "Dense(no-act)"),
        }
    }
}

/// Global fixed-point fraction widths shared by all layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedPoint {
    /// Fractional bits of the terminal class scores.
    pub scale_bits: u32,
    /// Fractional bits of the requantization factors.
    pub factor_scale_bits: u32,
}

/// Per-layer immutable parameters.
///
/// Dense layers use the degenerate geometry `k = s = din = 1`, with `cin`
/// the flattened input length and `cout` the number of outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerConfig {
    /// Kernel size (square).
    pub k: usize,
    /// Stride.
    pub s: usize,
    /// Input spatial size (square).
    pub din: usize,
    /// Input channels.
    pub cin: usize,
    /// Output channels (equal to `cin` for pooling).
    pub cout: usize,
    /// Input activation bits.
    pub ibit: u32,
    /// Weight bits.
    pub wbit: u32,
    /// Accumulator bits.
    pub mbit: u32,
    /// Output activation bits.
    pub abit: u32,
    /// Input-channel folding factor.
    pub in_p: usize,
    /// Output-channel folding factor.
    pub out_p: usize,
}

impl LayerConfig {
    /// Output spatial size: `floor((din − k) / s) + 1`, or 0 if `k > din`.
    #[must_use]
    pub const fn dout(&self) -> usize {
        if self.k > self.din || self.s == 0 {
            0
        } else {
            (self.din - self.k) / self.s + 1
        }
    }

    /// Terms summed into each accumulator: `k · k · cin`.
    #[must_use]
    pub const fn fan_in(&self) -> usize {
        self.k * self.k * self.cin
    }

    /// Weights held by the layer: `cout · cin · k · k`.
    #[must_use]
    pub const fn weight_count(&self) -> usize {
        self.cout * self.fan_in()
    }

    /// [`LayerConfig::weight_count`], or `None` if it overflows `usize`.
    #[must_use]
    pub const fn checked_weight_count(&self) -> Option<usize> {
        let Some(kk) = self.k.checked_mul(self.k) else {
            return None;
        };
        let Some(fan_in) = kk.checked_mul(self.cin) else {
            return None;
        };
        fan_in.checked_mul(self.cout)
    }

    /// Minimum signed accumulator width: `ibit + wbit + ceil(log2(fan_in))`.
    #[must_use]
    pub const fn required_accumulator_bits(&self) -> u32 {
        self.ibit + self.wbit + ceil_log2(self.fan_in())
    }

    /// Spare accumulator bits (negative means overflow is possible).
    #[must_use]
    pub const fn accumulator_headroom(&self) -> i64 {
        self.mbit as i64 - self.required_accumulator_bits() as i64
    }

    /// Shape of the stream this layer consumes (feature layers only).
    #[must_use]
    pub const fn input_shape(&self) -> StreamShape {
        StreamShape::square(self.din, self.cin, self.ibit as usize)
    }
}

/// Layout of one image on a stream: `rows × cols` elements, each holding
/// `channels` fields of `bits` bits, channel 0 at bit 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamShape {
    /// Rows per image.
    pub rows: usize,
    /// Elements per row.
    pub cols: usize,
    /// Fields per element.
    pub channels: usize,
    /// Bits per field.
    pub bits: usize,
}

impl StreamShape {
    /// Square feature map.
    #[must_use]
    pub const fn square(dim: usize, channels: usize, bits: usize) -> Self {
        Self { rows: dim, cols: dim, channels, bits }
    }

    /// One element per image holding a flat vector.
    #[must_use]
    pub const fn vector(len: usize, bits: usize) -> Self {
        Self { rows: 1, cols: 1, channels: len, bits }
    }

    /// Raw words: `count` elements of `width` bits per image.
    #[must_use]
    pub const fn words(count: usize, width: usize) -> Self {
        Self { rows: count, cols: 1, channels: 1, bits: width }
    }

    /// Elements per image.
    #[must_use]
    pub const fn elements(&self) -> usize {
        self.rows * self.cols
    }

    /// Width of one element in bits.
    #[must_use]
    pub const fn element_bits(&self) -> usize {
        self.channels * self.bits
    }

    /// Payload bits per image.
    #[must_use]
    pub const fn image_bits(&self) -> usize {
        self.elements() * self.element_bits()
    }

    /// Scalar values per image.
    #[must_use]
    pub const fn values(&self) -> usize {
        self.elements() * self.channels
    }
}

impl fmt::Display for StreamShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}×{}×{} @ {}b",
            self.rows, self.cols, self.channels, self.bits
        )
    }
}

/// `ceil(log2(n))`, with `ceil_log2(0) = ceil_log2(1) = 0`.
#[must_use]
pub const fn ceil_log2(n: usize) -> u32 {
    if n <= 1 {
        0
    } else {
        usize::BITS - (n - 1).leading_zeros()
    }
}
