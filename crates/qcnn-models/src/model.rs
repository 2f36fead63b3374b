// SPDX-License-Identifier: AGPL-3.0-only

//! Network model: topology plus per-layer parameters

use crate::error::{ModelError, Result};
use crate::parser;
use crate::weights::{value_range, RequantParams, WeightTensor, MAX_WEIGHT_BITS};
use qcnn_core::{FixedPoint, IngestLayout, LayerConfig, LayerKind, StreamShape};
use std::fs;
use std::path::Path;

/// Widest supported activation (input or output) field.
pub const MAX_ACTIVATION_BITS: u32 = 16;

/// Widest supported accumulator.
pub const MAX_ACCUMULATOR_BITS: u32 = 64;

/// Widest supported factor fraction.
pub const MAX_FACTOR_SCALE_BITS: u32 = 32;

/// One configured layer with its immutable parameters.
#[derive(Debug, Clone)]
pub struct LayerSpec {
    /// Layer name (also names the stream it produces)
    pub name: String,

    /// Stage kind
    pub kind: LayerKind,

    /// Geometry, widths and folding
    pub config: LayerConfig,

    /// Weights (absent for pooling)
    pub weights: Option<WeightTensor>,

    /// Requantization factors (absent for pooling, optional for no-act dense)
    pub requant: Option<RequantParams>,
}

impl LayerSpec {
    /// Convolution layer.
    pub fn conv(
        name: impl Into<String>,
        config: LayerConfig,
        weights: WeightTensor,
        requant: RequantParams,
    ) -> Self {
        Self {
            name: name.into(),
            kind: LayerKind::Conv,
            config,
            weights: Some(weights),
            requant: Some(requant),
        }
    }

    /// Max-pooling layer.
    pub fn pool(name: impl Into<String>, config: LayerConfig) -> Self {
        Self {
            name: name.into(),
            kind: LayerKind::Pool,
            config,
            weights: None,
            requant: None,
        }
    }

    /// Dense layer with activation.
    pub fn dense(
        name: impl Into<String>,
        config: LayerConfig,
        weights: WeightTensor,
        requant: RequantParams,
    ) -> Self {
        Self {
            name: name.into(),
            kind: LayerKind::Dense,
            config,
            weights: Some(weights),
            requant: Some(requant),
        }
    }

    /// Terminal dense layer producing raw scores.
    pub fn dense_no_act(
        name: impl Into<String>,
        config: LayerConfig,
        weights: WeightTensor,
        requant: Option<RequantParams>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: LayerKind::DenseNoAct,
            config,
            weights: Some(weights),
            requant,
        }
    }

    /// Shape of the stream this layer emits.
    #[must_use]
    pub const fn output_shape(&self) -> StreamShape {
        let c = &self.config;
        match self.kind {
            LayerKind::Conv => StreamShape::square(c.dout(), c.cout, c.abit as usize),
            LayerKind::Pool => StreamShape::square(c.dout(), c.cin, c.ibit as usize),
            LayerKind::Dense => StreamShape::vector(c.cout, c.abit as usize),
            LayerKind::DenseNoAct => StreamShape::vector(c.cout, c.mbit as usize),
        }
    }

    /// Check geometry, bit widths, folding and parameter shapes.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self, fixed: FixedPoint) -> Result<()> {
        let c = &self.config;
        let name = self.name.as_str();

        if c.k == 0 || c.s == 0 || c.din == 0 || c.cin == 0 || c.cout == 0 {
            return Err(ModelError::invalid_layer(name, "zero-sized dimension"));
        }
        if c.k > c.din {
            return Err(ModelError::invalid_layer(
                name,
                format!("kernel {} larger than input {}", c.k, c.din),
            ));
        }
        let weight_count = c
            .checked_weight_count()
            .ok_or_else(|| ModelError::invalid_layer(name, "weight count overflows usize"))?;
        if !(1..=MAX_ACTIVATION_BITS).contains(&c.ibit) {
            return Err(ModelError::bit_width(
                name,
                format!("Ibit={} outside 1..={MAX_ACTIVATION_BITS}", c.ibit),
            ));
        }

        match self.kind {
            LayerKind::Pool => {
                if c.cout != c.cin {
                    return Err(ModelError::invalid_layer(
                        name,
                        format!("pooling changes channels {} → {}", c.cin, c.cout),
                    ));
                }
                if c.abit != c.ibit {
                    return Err(ModelError::bit_width(
                        name,
                        format!("pooling changes width {} → {}", c.ibit, c.abit),
                    ));
                }
                return Ok(());
            }
            LayerKind::Dense | LayerKind::DenseNoAct => {
                if c.k != 1 || c.s != 1 || c.din != 1 {
                    return Err(ModelError::invalid_layer(
                        name,
                        "dense layers use k = s = din = 1",
                    ));
                }
            }
            LayerKind::Conv => {}
        }

        if self.kind.has_activation() && !(1..=MAX_ACTIVATION_BITS).contains(&c.abit) {
            return Err(ModelError::bit_width(
                name,
                format!("Abit={} outside 1..={MAX_ACTIVATION_BITS}", c.abit),
            ));
        }
        if !(1..=MAX_WEIGHT_BITS).contains(&c.wbit) {
            return Err(ModelError::bit_width(
                name,
                format!("Wbit={} outside 1..={MAX_WEIGHT_BITS}", c.wbit),
            ));
        }
        if !(1..=MAX_ACCUMULATOR_BITS).contains(&c.mbit) {
            return Err(ModelError::bit_width(
                name,
                format!("Mbit={} outside 1..={MAX_ACCUMULATOR_BITS}", c.mbit),
            ));
        }
        self.validate_folding()?;

        let mut required = c.required_accumulator_bits();
        if self.kind == LayerKind::DenseNoAct && self.requant.is_none() {
            // score = acc << SCALE_BITS must still fit
            required += fixed.scale_bits;
        }
        if c.mbit < required {
            return Err(ModelError::AccumulatorOverflow {
                layer: self.name.clone(),
                mbit: c.mbit,
                required,
            });
        }

        let weights = self
            .weights
            .as_ref()
            .ok_or_else(|| ModelError::invalid_layer(name, "missing weights"))?;
        if weights.wbit() != c.wbit {
            return Err(ModelError::bit_width(
                name,
                format!("weights are {}-bit, layer declares Wbit={}", weights.wbit(), c.wbit),
            ));
        }
        if weights.len() != weight_count {
            return Err(ModelError::weight_shape(
                name,
                "weights",
                weight_count,
                weights.len(),
            ));
        }

        match (&self.requant, self.kind) {
            (Some(r), _) if r.len() != c.cout => {
                return Err(ModelError::weight_shape(
                    name,
                    "requant factors",
                    c.cout,
                    r.len(),
                ));
            }
            (None, LayerKind::Conv | LayerKind::Dense) => {
                return Err(ModelError::invalid_layer(
                    name,
                    "missing requantization factors",
                ));
            }
            (Some(r), LayerKind::DenseNoAct) => self.validate_score_range(r, fixed)?,
            _ => {}
        }
        Ok(())
    }

    /// Scaled terminal scores, `(acc · A + B) >> (F − S)`, must fit `Mbit`
    /// signed bits for every input or the wrap reorders classes.
    #[allow(clippy::cast_possible_wrap)]
    fn validate_score_range(&self, requant: &RequantParams, fixed: FixedPoint) -> Result<()> {
        let c = &self.config;
        let max_input = (1i128 << c.ibit) - 1;
        let (lo, hi) = value_range(c.wbit);
        let max_weight = i128::from(lo.unsigned_abs().max(hi.unsigned_abs()));
        let max_acc = max_input * max_weight * c.fan_in() as i128;

        let worst = requant
            .factor_a()
            .iter()
            .zip(requant.factor_b())
            .map(|(&a, &b)| max_acc * i128::from(a.unsigned_abs()) + i128::from(b.unsigned_abs()))
            .max()
            .unwrap_or(0);
        let shift = fixed
            .factor_scale_bits
            .saturating_sub(fixed.scale_bits)
            .min(MAX_FACTOR_SCALE_BITS);
        // rounded up so floored negative scores are covered
        let magnitude = (worst + (1i128 << shift) - 1) >> shift;
        let required = i128::BITS - magnitude.leading_zeros() + 1;

        if c.mbit < required {
            return Err(ModelError::AccumulatorOverflow {
                layer: self.name.clone(),
                mbit: c.mbit,
                required,
            });
        }
        Ok(())
    }

    fn validate_folding(&self) -> Result<()> {
        let c = &self.config;
        if c.in_p == 0 || c.out_p == 0 {
            return Err(ModelError::invalid_layer(&self.name, "folding factor of zero"));
        }
        if c.cin % c.in_p != 0 {
            return Err(ModelError::invalid_layer(
                &self.name,
                format!("InP={} does not divide Cin={}", c.in_p, c.cin),
            ));
        }
        if c.cout % c.out_p != 0 {
            return Err(ModelError::invalid_layer(
                &self.name,
                format!("OutP={} does not divide Cout={}", c.out_p, c.cout),
            ));
        }
        Ok(())
    }
}

/// Quantized CNN model
#[derive(Debug, Clone)]
pub struct Model {
    fixed_point: FixedPoint,
    ingest: IngestLayout,
    layers: Vec<LayerSpec>,
}

impl Model {
    /// Assemble and validate a model.
    ///
    /// Every layer is checked in isolation; stream compatibility between
    /// neighbours is checked when an engine is built from the model.
    ///
    /// # Errors
    ///
    /// Returns error if the fixed-point widths or any layer are invalid.
    pub fn new(fixed_point: FixedPoint, ingest: IngestLayout, layers: Vec<LayerSpec>) -> Result<Self> {
        if fixed_point.factor_scale_bits > MAX_FACTOR_SCALE_BITS {
            return Err(ModelError::bit_width(
                "model",
                format!(
                    "FACTOR_SCALE_BITS={} exceeds {MAX_FACTOR_SCALE_BITS}",
                    fixed_point.factor_scale_bits
                ),
            ));
        }
        if fixed_point.scale_bits > fixed_point.factor_scale_bits {
            return Err(ModelError::bit_width(
                "model",
                format!(
                    "SCALE_BITS={} exceeds FACTOR_SCALE_BITS={}",
                    fixed_point.scale_bits, fixed_point.factor_scale_bits
                ),
            ));
        }
        if layers.is_empty() {
            return Err(ModelError::invalid_layer("model", "no layers"));
        }
        for layer in &layers {
            layer.validate(fixed_point)?;
        }
        tracing::debug!(
            "Model: {} layers, SCALE_BITS={}, FACTOR_SCALE_BITS={}",
            layers.len(),
            fixed_point.scale_bits,
            fixed_point.factor_scale_bits
        );
        Ok(Self {
            fixed_point,
            ingest,
            layers,
        })
    }

    /// Load model from a `.qcnn` blob file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        tracing::info!("Loading model from: {}", path.display());

        if !path.exists() {
            return Err(ModelError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let data = fs::read(path)?;
        Self::from_bytes(data)
    }

    /// Parse model from a blob
    ///
    /// # Errors
    ///
    /// Returns error if parsing or validation fails.
    pub fn from_bytes(data: impl Into<bytes::Bytes>) -> Result<Self> {
        parser::parse_model(data.into())
    }

    /// Serialize to the `.qcnn` blob format
    #[must_use]
    pub fn to_bytes(&self) -> bytes::Bytes {
        parser::pack_model(self)
    }

    /// Write the blob to `path`
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path.as_ref(), self.to_bytes())?;
        tracing::info!("Saved model to: {}", path.as_ref().display());
        Ok(())
    }

    /// Fixed-point fraction widths
    #[must_use]
    pub const fn fixed_point(&self) -> FixedPoint {
        self.fixed_point
    }

    /// Input line layout
    #[must_use]
    pub const fn ingest(&self) -> IngestLayout {
        self.ingest
    }

    /// Layers in execution order
    #[must_use]
    pub fn layers(&self) -> &[LayerSpec] {
        &self.layers
    }

    /// Number of layers
    #[must_use]
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Stream shape the first layer consumes
    #[must_use]
    pub fn input_shape(&self) -> StreamShape {
        let first = &self.layers[0];
        if first.kind.is_dense() {
            StreamShape::vector(first.config.cin, first.config.ibit as usize)
        } else {
            first.config.input_shape()
        }
    }

    /// Terminal layer
    #[must_use]
    pub fn terminal(&self) -> &LayerSpec {
        &self.layers[self.layers.len() - 1]
    }

    /// Total weights across all layers
    #[must_use]
    pub fn total_weight_count(&self) -> usize {
        self.layers
            .iter()
            .filter_map(|l| l.weights.as_ref())
            .map(WeightTensor::len)
            .sum()
    }
}
