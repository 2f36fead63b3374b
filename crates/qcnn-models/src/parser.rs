// SPDX-License-Identifier: AGPL-3.0-only

//! Binary codec for `.qcnn` model blobs
//!
//! ```text
//! Header (16 bytes, little-endian)
//!   0  magic "QCNN"
//!   4  u16 version (= 1)
//!   6  u16 layer count
//!   8  u8  SCALE_BITS
//!   9  u8  FACTOR_SCALE_BITS
//!  10  u16 ingest line bits
//!  12  u16 ingest lines per image
//!  14  u16 reserved (0)
//!
//! Layer record
//!   u8 kind tag, u8 name length, name bytes
//!   u16 k, s, din, cin, cout
//!   u8  ibit, wbit, mbit, abit
//!   u16 in_p, out_p
//!   u32 packed weight bytes, packed weights
//!   u8  has requant, then cout × i32 factorA and cout × i32 factorB
//! ```

use crate::error::{ModelError, Result};
use crate::model::{LayerSpec, Model, MAX_ACTIVATION_BITS};
use crate::weights::{packed_len, RequantParams, WeightTensor, MAX_WEIGHT_BITS};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use qcnn_core::{FixedPoint, IngestLayout, LayerConfig, LayerKind};

/// Blob magic bytes
pub const MODEL_MAGIC: [u8; 4] = *b"QCNN";

/// Current blob version
pub const MODEL_VERSION: u16 = 1;

/// Header size in bytes
pub const HEADER_LEN: usize = 16;

/// Parsed blob header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelHeader {
    /// Blob version
    pub version: u16,

    /// Number of layer records
    pub layer_count: usize,

    /// Fixed-point fraction widths
    pub fixed_point: FixedPoint,

    /// Input line layout
    pub ingest: IngestLayout,
}

/// Parse and check the 16-byte header.
///
/// # Errors
///
/// Returns error if the data is too short or magic/version are wrong.
pub fn parse_header(data: &[u8]) -> Result<ModelHeader> {
    tracing::debug!("Parsing model header ({} bytes)", data.len());

    if data.len() < HEADER_LEN {
        return Err(ModelError::parse_error("File too small"));
    }
    if data[0..4] != MODEL_MAGIC {
        tracing::error!("Invalid magic bytes: {:02x?}", &data[0..4]);
        return Err(ModelError::InvalidHeader);
    }

    let mut buf = &data[4..HEADER_LEN];
    let version = buf.get_u16_le();
    if version != MODEL_VERSION {
        return Err(ModelError::UnsupportedVersion { version });
    }
    let layer_count = usize::from(buf.get_u16_le());
    let scale_bits = u32::from(buf.get_u8());
    let factor_scale_bits = u32::from(buf.get_u8());
    let line_bits = usize::from(buf.get_u16_le());
    let lines_per_image = usize::from(buf.get_u16_le());

    if line_bits == 0 || lines_per_image == 0 {
        return Err(ModelError::parse_error("empty ingest layout"));
    }

    Ok(ModelHeader {
        version,
        layer_count,
        fixed_point: FixedPoint {
            scale_bits,
            factor_scale_bits,
        },
        ingest: IngestLayout {
            line_bits,
            lines_per_image,
        },
    })
}

/// Parse a whole blob into a validated [`Model`].
///
/// Weight blocks are decoded straight out of `data` without an
/// intermediate copy.
///
/// # Errors
///
/// Returns error on truncation, unknown tags, trailing bytes or any
/// validation failure.
pub fn parse_model(data: Bytes) -> Result<Model> {
    let header = parse_header(&data)?;
    let mut cursor = data.slice(HEADER_LEN..);

    let mut layers = Vec::with_capacity(header.layer_count);
    for index in 0..header.layer_count {
        let layer = parse_layer(&mut cursor, index)?;
        tracing::debug!("Layer {}: {} {:?}", index, layer.kind, layer.name);
        layers.push(layer);
    }
    if cursor.has_remaining() {
        return Err(ModelError::parse_error(format!(
            "{} trailing bytes after last layer",
            cursor.remaining()
        )));
    }

    Model::new(header.fixed_point, header.ingest, layers)
}

fn parse_layer(cursor: &mut Bytes, index: usize) -> Result<LayerSpec> {
    need(cursor, 2, "layer tag")?;
    let tag = cursor.get_u8();
    let kind = LayerKind::from_tag(tag).ok_or_else(|| {
        ModelError::parse_error(format!("layer {index}: unknown kind tag {tag}"))
    })?;
    let name_len = usize::from(cursor.get_u8());
    need(cursor, name_len, "layer name")?;
    let name = String::from_utf8(cursor.split_to(name_len).to_vec())
        .map_err(|_| ModelError::parse_error(format!("layer {index}: name is not UTF-8")))?;

    need(cursor, 5 * 2 + 4 + 2 * 2, "layer geometry")?;
    let k = usize::from(cursor.get_u16_le());
    let s = usize::from(cursor.get_u16_le());
    let din = usize::from(cursor.get_u16_le());
    let cin = usize::from(cursor.get_u16_le());
    let cout = usize::from(cursor.get_u16_le());
    let ibit = u32::from(cursor.get_u8());
    let wbit = u32::from(cursor.get_u8());
    let mbit = u32::from(cursor.get_u8());
    let abit = u32::from(cursor.get_u8());
    let in_p = usize::from(cursor.get_u16_le());
    let out_p = usize::from(cursor.get_u16_le());
    let config = LayerConfig {
        k,
        s,
        din,
        cin,
        cout,
        ibit,
        wbit,
        mbit,
        abit,
        in_p,
        out_p,
    };

    need(cursor, 4, "weight length")?;
    let weight_bytes = cursor.get_u32_le() as usize;
    need(cursor, weight_bytes, "weights")?;
    let block = cursor.split_to(weight_bytes);

    need(cursor, 1, "requant flag")?;
    let has_requant = cursor.get_u8() != 0;
    let requant = if has_requant {
        need(cursor, cout * 8, "requant factors")?;
        let factor_a = (0..cout).map(|_| cursor.get_i32_le()).collect();
        let factor_b = (0..cout).map(|_| cursor.get_i32_le()).collect();
        Some(RequantParams::new(factor_a, factor_b)?)
    } else {
        None
    };

    if !kind.has_weights() {
        if weight_bytes != 0 || requant.is_some() {
            return Err(ModelError::invalid_layer(
                &name,
                "pooling layer carries parameters",
            ));
        }
        return Ok(LayerSpec::pool(name, config));
    }

    if !(1..=MAX_WEIGHT_BITS).contains(&wbit) {
        return Err(ModelError::bit_width(
            &name,
            format!("Wbit={wbit} outside 1..={MAX_WEIGHT_BITS}"),
        ));
    }
    if !(1..=MAX_ACTIVATION_BITS).contains(&ibit) {
        return Err(ModelError::bit_width(
            &name,
            format!("Ibit={ibit} outside 1..={MAX_ACTIVATION_BITS}"),
        ));
    }
    if kind.has_activation() && !(1..=MAX_ACTIVATION_BITS).contains(&abit) {
        return Err(ModelError::bit_width(
            &name,
            format!("Abit={abit} outside 1..={MAX_ACTIVATION_BITS}"),
        ));
    }
    let count = config
        .checked_weight_count()
        .ok_or_else(|| ModelError::parse_error(format!("layer {index}: weight count overflows")))?;
    let expected = packed_len(wbit, count).ok_or_else(|| {
        ModelError::parse_error(format!("layer {index}: packed weight size overflows"))
    })?;
    if weight_bytes != expected {
        return Err(ModelError::weight_shape(
            &name,
            "packed weight bytes",
            expected,
            weight_bytes,
        ));
    }
    let weights = WeightTensor::from_packed(wbit, count, &block)?;

    Ok(LayerSpec {
        name,
        kind,
        config,
        weights: Some(weights),
        requant,
    })
}

fn need(cursor: &Bytes, len: usize, what: &str) -> Result<()> {
    if cursor.remaining() < len {
        return Err(ModelError::parse_error(format!(
            "truncated {what}: need {len} bytes, {} left",
            cursor.remaining()
        )));
    }
    Ok(())
}

/// Serialize a model to the blob format.
///
/// Values are written with the widths the header documents; the
/// configurations [`Model::new`] accepts all fit.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn pack_model(model: &Model) -> Bytes {
    let fixed = model.fixed_point();
    let ingest = model.ingest();

    let mut buf = BytesMut::with_capacity(HEADER_LEN + model.total_weight_count() / 8 + 64);
    buf.put_slice(&MODEL_MAGIC);
    buf.put_u16_le(MODEL_VERSION);
    buf.put_u16_le(model.layer_count() as u16);
    buf.put_u8(fixed.scale_bits as u8);
    buf.put_u8(fixed.factor_scale_bits as u8);
    buf.put_u16_le(ingest.line_bits as u16);
    buf.put_u16_le(ingest.lines_per_image as u16);
    buf.put_u16_le(0);

    for layer in model.layers() {
        let c = &layer.config;
        buf.put_u8(layer.kind.tag());
        buf.put_u8(layer.name.len() as u8);
        buf.put_slice(layer.name.as_bytes());
        for v in [c.k, c.s, c.din, c.cin, c.cout] {
            buf.put_u16_le(v as u16);
        }
        for v in [c.ibit, c.wbit, c.mbit, c.abit] {
            buf.put_u8(v as u8);
        }
        buf.put_u16_le(c.in_p as u16);
        buf.put_u16_le(c.out_p as u16);

        match &layer.weights {
            Some(w) => {
                let packed = w.pack();
                buf.put_u32_le(packed.len() as u32);
                buf.put_slice(&packed);
            }
            None => buf.put_u32_le(0),
        }
        match &layer.requant {
            Some(r) => {
                buf.put_u8(1);
                r.write_le(&mut buf);
            }
            None => buf.put_u8(0),
        }
    }

    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_model() -> Model {
        let fixed = FixedPoint {
            scale_bits: 0,
            factor_scale_bits: 8,
        };
        let conv = LayerConfig {
            k: 2,
            s: 1,
            din: 3,
            cin: 1,
            cout: 2,
            ibit: 1,
            wbit: 1,
            mbit: 8,
            abit: 2,
            in_p: 1,
            out_p: 1,
        };
        let dense = LayerConfig {
            k: 1,
            s: 1,
            din: 1,
            cin: 8,
            cout: 3,
            ibit: 2,
            wbit: 3,
            mbit: 10,
            abit: 0,
            in_p: 2,
            out_p: 3,
        };
        let cw = WeightTensor::new(1, vec![1, -1, 1, 1, -1, -1, 1, -1]).unwrap();
        let dw = WeightTensor::new(3, (0..24).map(|i| (i % 8) as i8 - 4).collect()).unwrap();
        let requant = RequantParams::new(vec![256, 128], vec![-3, 7]).unwrap();
        Model::new(
            fixed,
            IngestLayout {
                line_bits: 9,
                lines_per_image: 1,
            },
            vec![
                LayerSpec::conv("c0", conv, cw, requant),
                LayerSpec::dense_no_act("fc", dense, dw, None),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_header_layout() {
        let blob = tiny_model().to_bytes();
        assert_eq!(&blob[0..4], b"QCNN");
        let header = parse_header(&blob).unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(header.layer_count, 2);
        assert_eq!(header.ingest.line_bits, 9);
        assert_eq!(header.fixed_point.factor_scale_bits, 8);
    }

    #[test]
    fn test_blob_preserves_parameters() {
        let model = tiny_model();
        let parsed = parse_model(model.to_bytes()).unwrap();
        assert_eq!(parsed.layer_count(), 2);
        for (a, b) in model.layers().iter().zip(parsed.layers()) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.kind, b.kind);
            assert_eq!(a.config, b.config);
            assert_eq!(a.weights, b.weights);
            assert_eq!(a.requant, b.requant);
        }
    }

    #[test]
    fn test_bad_magic() {
        let mut blob = tiny_model().to_bytes().to_vec();
        blob[0] = b'X';
        assert!(matches!(
            parse_model(blob.into()),
            Err(ModelError::InvalidHeader)
        ));
    }

    #[test]
    fn test_bad_version() {
        let mut blob = tiny_model().to_bytes().to_vec();
        blob[4] = 7;
        assert!(matches!(
            parse_model(blob.into()),
            Err(ModelError::UnsupportedVersion { version: 7 })
        ));
    }

    #[test]
    fn test_truncation_detected() {
        let blob = tiny_model().to_bytes();
        for cut in [HEADER_LEN + 1, HEADER_LEN + 20, blob.len() - 1] {
            let err = parse_model(blob.slice(..cut)).unwrap_err();
            assert!(matches!(err, ModelError::ParseError { .. }), "cut at {cut}");
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut blob = tiny_model().to_bytes().to_vec();
        blob.push(0);
        assert!(parse_model(blob.into()).is_err());
    }

    /// Header plus one conv record with the given geometry and widths.
    fn crafted_blob(dim: u16, wbit: u8, abit: u8, weight_bytes: u32) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(&MODEL_MAGIC);
        buf.put_u16_le(MODEL_VERSION);
        buf.put_u16_le(1);
        buf.put_u8(0);
        buf.put_u8(8);
        buf.put_u16_le(8);
        buf.put_u16_le(1);
        buf.put_u16_le(0);
        buf.put_u8(LayerKind::Conv.tag());
        buf.put_u8(1);
        buf.put_slice(b"c");
        for _ in 0..5 {
            buf.put_u16_le(dim);
        }
        buf.put_slice(&[1, wbit, 32, abit]);
        buf.put_u16_le(1);
        buf.put_u16_le(1);
        buf.put_u32_le(weight_bytes);
        buf.put_bytes(0, weight_bytes as usize);
        buf.put_u8(0);
        buf.freeze()
    }

    #[test]
    fn test_malformed_widths_rejected_before_sizing() {
        let err = parse_model(crafted_blob(u16::MAX, 255, 4, 0)).unwrap_err();
        assert!(matches!(err, ModelError::BitWidth { .. }), "{err}");
        let err = parse_model(crafted_blob(1, 1, 0, 1)).unwrap_err();
        assert!(matches!(err, ModelError::BitWidth { .. }), "{err}");
    }

    #[test]
    fn test_huge_geometry_is_an_error() {
        // u16::MAX⁴ weights can never match an empty block
        let err = parse_model(crafted_blob(u16::MAX, 8, 4, 0)).unwrap_err();
        assert!(
            matches!(err, ModelError::ParseError { .. } | ModelError::WeightShape { .. }),
            "{err}"
        );
        let err = parse_model(crafted_blob(u16::MAX, 1, 4, 0)).unwrap_err();
        assert!(matches!(err, ModelError::WeightShape { expected, .. } if expected > 0));
    }

    #[test]
    fn test_too_small() {
        assert!(matches!(
            parse_header(b"QCNN"),
            Err(ModelError::ParseError { .. })
        ));
    }
}
