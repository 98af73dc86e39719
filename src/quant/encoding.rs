//! Affine encoding data structure and legacy export records

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::quant::affine::{quant_range, Granularity};

/// The (scale, offset, bitwidth, signed, symmetric) tuple defining an
/// affine quantizer's numeric mapping, one scale/offset pair per block.
///
/// Invariants: every scale is positive; every offset lies inside the
/// integer range derived from bitwidth and signedness.
#[derive(Clone, Debug, PartialEq)]
pub struct AffineEncoding {
    pub scale: Vec<f32>,
    pub offset: Vec<f32>,
    pub bitwidth: u32,
    pub signed: bool,
    pub symmetric: bool,
    pub granularity: Granularity,
}

impl AffineEncoding {
    pub fn new(
        scale: Vec<f32>,
        offset: Vec<f32>,
        bitwidth: u32,
        signed: bool,
        symmetric: bool,
        granularity: Granularity,
    ) -> Result<Self> {
        let encoding = Self {
            scale,
            offset,
            bitwidth,
            signed,
            symmetric,
            granularity,
        };
        encoding.validate()?;
        Ok(encoding)
    }

    fn validate(&self) -> Result<()> {
        if self.scale.len() != self.offset.len() || self.scale.is_empty() {
            return Err(Error::EncodingValidation(format!(
                "scale/offset block counts disagree: {} vs {}",
                self.scale.len(),
                self.offset.len()
            )));
        }
        if let Some(s) = self.scale.iter().find(|s| **s <= 0.0) {
            return Err(Error::EncodingValidation(format!(
                "scale must be positive, got {s}"
            )));
        }
        // Asymmetric offsets are negative grid positions (round(min/scale)),
        // so the admissible interval spans the full bin count on both sides.
        let num_bins = ((1i64 << self.bitwidth) - 1) as f32;
        if let Some(o) = self
            .offset
            .iter()
            .find(|o| **o < -num_bins || **o > num_bins)
        {
            return Err(Error::EncodingValidation(format!(
                "offset {o} outside [{}, {}]",
                -num_bins, num_bins
            )));
        }
        Ok(())
    }

    pub fn num_blocks(&self) -> usize {
        self.scale.len()
    }

    pub fn quant_range(&self) -> (i64, i64) {
        quant_range(self.bitwidth, self.signed)
    }

    fn negative_steps(&self) -> f32 {
        if self.signed {
            (1i64 << (self.bitwidth - 1)) as f32
        } else {
            0.0
        }
    }

    fn positive_steps(&self) -> f32 {
        if self.signed {
            ((1i64 << (self.bitwidth - 1)) - 1) as f32
        } else {
            ((1i64 << self.bitwidth) - 1) as f32
        }
    }

    /// Representable minimum per block: `scale * (offset - negative_steps)`.
    pub fn min(&self) -> Vec<f32> {
        let neg = self.negative_steps();
        self.scale
            .iter()
            .zip(&self.offset)
            .map(|(s, o)| s * (o - neg))
            .collect()
    }

    /// Representable maximum per block: `scale * (offset + positive_steps)`.
    pub fn max(&self) -> Vec<f32> {
        let pos = self.positive_steps();
        self.scale
            .iter()
            .zip(&self.offset)
            .map(|(s, o)| s * (o + pos))
            .collect()
    }

    /// Export in the legacy per-block record format.
    ///
    /// Legacy consumers expect the offset shifted by `-2^(bw-1)` for
    /// signed encodings and Python-style capitalized boolean strings;
    /// both quirks are preserved bit for bit.
    pub fn legacy_records(&self) -> Vec<EncodingRecord> {
        let shift = if self.signed {
            1i64 << (self.bitwidth - 1)
        } else {
            0
        };
        let mins = self.min();
        let maxs = self.max();
        (0..self.num_blocks())
            .map(|b| EncodingRecord {
                min: mins[b] as f64,
                max: maxs[b] as f64,
                scale: self.scale[b] as f64,
                offset: self.offset[b].round() as i64 - shift,
                bitwidth: self.bitwidth,
                dtype: "int".to_string(),
                is_symmetric: if self.symmetric { "True" } else { "False" }.to_string(),
            })
            .collect()
    }
}

/// One exported encoding record, matching the legacy file format field
/// for field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncodingRecord {
    pub min: f64,
    pub max: f64,
    pub scale: f64,
    pub offset: i64,
    pub bitwidth: u32,
    pub dtype: String,
    pub is_symmetric: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_min_max_derivation_unsigned() {
        let enc = AffineEncoding::new(
            vec![0.5],
            vec![10.0],
            8,
            false,
            false,
            Granularity::PerTensor,
        )
        .unwrap();
        // min = 0.5 * (10 - 0), max = 0.5 * (10 + 255)
        assert_abs_diff_eq!(enc.min()[0], 5.0, epsilon = 1e-6);
        assert_abs_diff_eq!(enc.max()[0], 132.5, epsilon = 1e-6);
    }

    #[test]
    fn test_min_max_derivation_signed_symmetric() {
        let enc =
            AffineEncoding::new(vec![0.1], vec![0.0], 8, true, true, Granularity::PerTensor)
                .unwrap();
        assert_abs_diff_eq!(enc.min()[0], -12.8, epsilon = 1e-5);
        assert_abs_diff_eq!(enc.max()[0], 12.7, epsilon = 1e-5);
    }

    #[test]
    fn test_validation_rejects_bad_scale_and_offset() {
        assert!(AffineEncoding::new(
            vec![-1.0],
            vec![0.0],
            8,
            false,
            false,
            Granularity::PerTensor
        )
        .is_err());
        assert!(AffineEncoding::new(
            vec![1.0],
            vec![300.0],
            8,
            false,
            false,
            Granularity::PerTensor
        )
        .is_err());
    }

    #[test]
    fn test_legacy_offset_shift_for_signed_symmetric() {
        let enc =
            AffineEncoding::new(vec![0.1], vec![0.0], 8, true, true, Granularity::PerTensor)
                .unwrap();
        let records = enc.legacy_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].offset, -128);
        assert_eq!(records[0].is_symmetric, "True");
        assert_eq!(records[0].dtype, "int");
    }

    #[test]
    fn test_legacy_offset_unshifted_for_unsigned() {
        let enc = AffineEncoding::new(
            vec![0.1],
            vec![-64.0],
            8,
            false,
            false,
            Granularity::PerTensor,
        )
        .unwrap();
        let records = enc.legacy_records();
        assert_eq!(records[0].offset, -64);
        assert_eq!(records[0].is_symmetric, "False");
    }

    #[test]
    fn test_legacy_records_serialize_like_the_legacy_format() {
        let enc =
            AffineEncoding::new(vec![0.5], vec![0.0], 8, true, true, Granularity::PerTensor)
                .unwrap();
        let json = serde_json::to_value(&enc.legacy_records()[0]).unwrap();
        assert_eq!(json["dtype"], "int");
        assert_eq!(json["is_symmetric"], "True");
        assert_eq!(json["bitwidth"], 8);
        assert_eq!(json["offset"], -128);
    }
}
