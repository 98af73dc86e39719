//! Min-max affine quantizer
//!
//! A quantizer owns per-block `min`/`max` range parameters and an
//! encoding analyzer. Outside calibration it fake-quantizes its input
//! against the committed range; inside a calibration scope it observes
//! statistics and quantizes dynamically with the current batch bounds.
//! Two quantization modes are supported: (unsigned) asymmetric and
//! signed-symmetric.

use std::ops::{Deref, DerefMut};

use crate::error::{Error, Result};
use crate::nn::Tensor;
use crate::quant::affine::{self, quant_range, ste_round, Granularity};
use crate::quant::analyzer::{CalibrationMethod, EncodingAnalyzer};
use crate::quant::encoding::{AffineEncoding, EncodingRecord};

/// Affine quantizer with min-max range parameters.
#[derive(Clone, Debug)]
pub struct MinMaxQuantizer {
    name: String,
    bitwidth: u32,
    symmetric: bool,
    signed: bool,
    granularity: Granularity,
    num_blocks: usize,
    min: Option<Vec<f32>>,
    max: Option<Vec<f32>>,
    analyzer: EncodingAnalyzer,
    observing: bool,
}

impl MinMaxQuantizer {
    /// Per-tensor quantizer with min-max calibration.
    pub fn new(name: impl Into<String>, bitwidth: u32, symmetric: bool) -> Self {
        Self::with_granularity(name, bitwidth, symmetric, Granularity::PerTensor, 1)
    }

    /// Per-channel quantizer along `axis` with `num_channels` blocks.
    pub fn per_channel(
        name: impl Into<String>,
        bitwidth: u32,
        symmetric: bool,
        axis: usize,
        num_channels: usize,
    ) -> Self {
        Self::with_granularity(
            name,
            bitwidth,
            symmetric,
            Granularity::PerChannel { axis },
            num_channels,
        )
    }

    fn with_granularity(
        name: impl Into<String>,
        bitwidth: u32,
        symmetric: bool,
        granularity: Granularity,
        num_blocks: usize,
    ) -> Self {
        Self {
            name: name.into(),
            bitwidth,
            symmetric,
            // Two supported modes: unsigned-asymmetric and signed-symmetric
            signed: symmetric,
            granularity,
            num_blocks,
            min: None,
            max: None,
            analyzer: EncodingAnalyzer::new(CalibrationMethod::MinMax, granularity, num_blocks),
            observing: false,
        }
    }

    /// Replace the calibration method (keeps any committed range).
    pub fn with_method(mut self, method: CalibrationMethod) -> Self {
        self.analyzer = EncodingAnalyzer::new(method, self.granularity, self.num_blocks);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bitwidth(&self) -> u32 {
        self.bitwidth
    }

    pub fn symmetric(&self) -> bool {
        self.symmetric
    }

    pub fn signed(&self) -> bool {
        self.signed
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn is_initialized(&self) -> bool {
        self.min.is_some() && self.max.is_some()
    }

    pub fn is_observing(&self) -> bool {
        self.observing
    }

    /// Set the quantization range explicitly. The block count must match
    /// and `min` must be strictly below `max` in every block.
    pub fn set_range(&mut self, min: &[f32], max: &[f32]) -> Result<()> {
        if min.len() != self.num_blocks || max.len() != self.num_blocks {
            return Err(Error::EncodingValidation(format!(
                "range for '{}' must have {} blocks, got {}/{}",
                self.name,
                self.num_blocks,
                min.len(),
                max.len()
            )));
        }
        if let Some((lo, hi)) = min.iter().zip(max).find(|(lo, hi)| lo >= hi) {
            return Err(Error::EncodingValidation(format!(
                "range for '{}' must satisfy min < max, got [{lo}, {hi}]",
                self.name
            )));
        }
        self.min = Some(min.to_vec());
        self.max = Some(max.to_vec());
        Ok(())
    }

    /// Quantization scale per block: `(max - min) / (2^bw - 1)`.
    pub fn get_scale(&self) -> Option<Vec<f32>> {
        let min = self.min.as_ref()?;
        let max = self.max.as_ref()?;
        let num_bins = ((1i64 << self.bitwidth) - 1) as f32;
        Some(
            min.iter()
                .zip(max)
                .map(|(lo, hi)| (hi - lo) / num_bins)
                .collect(),
        )
    }

    /// Quantization offset per block. Symmetric mode always yields zero;
    /// asymmetric mode rounds `min / scale`, shifted by `2^(bw-1)` when
    /// signed.
    pub fn get_offset(&self) -> Option<Vec<f32>> {
        let min = self.min.as_ref()?;
        if self.symmetric {
            return Some(vec![0.0; self.num_blocks]);
        }
        let scale = self.get_scale()?;
        let shift = if self.signed {
            (1i64 << (self.bitwidth - 1)) as f32
        } else {
            0.0
        };
        Some(
            min.iter()
                .zip(&scale)
                .map(|(lo, s)| ste_round(lo / s) + shift)
                .collect(),
        )
    }

    /// Recalibrated minimum: `scale * (offset - negative_steps)`. May
    /// differ slightly from the raw committed `min`.
    pub fn get_min(&self) -> Option<Vec<f32>> {
        let scale = self.get_scale()?;
        let offset = self.get_offset()?;
        let neg = if self.signed {
            (1i64 << (self.bitwidth - 1)) as f32
        } else {
            0.0
        };
        Some(
            scale
                .iter()
                .zip(&offset)
                .map(|(s, o)| s * (o - neg))
                .collect(),
        )
    }

    /// Recalibrated maximum: `scale * (offset + positive_steps)`.
    pub fn get_max(&self) -> Option<Vec<f32>> {
        let scale = self.get_scale()?;
        let offset = self.get_offset()?;
        let pos = if self.signed {
            ((1i64 << (self.bitwidth - 1)) - 1) as f32
        } else {
            ((1i64 << self.bitwidth) - 1) as f32
        };
        Some(
            scale
                .iter()
                .zip(&offset)
                .map(|(s, o)| s * (o + pos))
                .collect(),
        )
    }

    /// The committed encoding, or `None` before calibration.
    pub fn encoding(&self) -> Option<AffineEncoding> {
        let scale = self.get_scale()?;
        let offset = self.get_offset()?;
        AffineEncoding::new(
            scale,
            offset,
            self.bitwidth,
            self.signed,
            self.symmetric,
            self.granularity,
        )
        .ok()
    }

    /// Per-block records in the legacy export format.
    pub fn legacy_encodings(&self) -> Option<Vec<EncodingRecord>> {
        Some(self.encoding()?.legacy_records())
    }

    /// Quantize to integer-valued data against the committed range.
    pub fn quantize(&self, tensor: &Tensor) -> Result<Tensor> {
        let (scale, offset) = self.committed_params()?;
        let (qmin, qmax) = quant_range(self.bitwidth, self.signed);
        affine::quantize(tensor, &scale, &offset, qmin, qmax, self.granularity)
    }

    /// Dequantize integer-valued data against the committed range.
    pub fn dequantize(&self, tensor: &Tensor) -> Result<Tensor> {
        let (scale, offset) = self.committed_params()?;
        affine::dequantize(tensor, &scale, &offset, self.granularity)
    }

    /// Forward pass. Outside a calibration scope this fake-quantizes
    /// against the committed range (failing if uninitialized); inside a
    /// scope it observes the batch and quantizes dynamically with the
    /// batch statistics.
    pub fn forward(&mut self, tensor: &Tensor) -> Result<Tensor> {
        if self.observing {
            let (batch_min, batch_max) = self.analyzer.update_stats(tensor)?;
            let (min, max) = self.finalize_bounds(batch_min, batch_max);
            let (scale, offset) = self.derive_params(&min, &max);
            let (qmin, qmax) = quant_range(self.bitwidth, self.signed);
            return affine::quantize_dequantize(
                tensor,
                &scale,
                &offset,
                qmin,
                qmax,
                self.granularity,
            );
        }

        let (scale, offset) = self.committed_params()?;
        let (qmin, qmax) = quant_range(self.bitwidth, self.signed);
        affine::quantize_dequantize(tensor, &scale, &offset, qmin, qmax, self.granularity)
    }

    /// Enter a calibration scope. Statistics accumulate until the scope
    /// is finished (committing the range) or dropped (restoring the
    /// previous state and clearing partial statistics).
    pub fn begin_calibration(&mut self) -> CalibrationScope<'_> {
        self.begin_observing();
        CalibrationScope {
            quantizer: self,
            finished: false,
        }
    }

    pub(crate) fn begin_observing(&mut self) {
        self.observing = true;
    }

    /// Leave observing mode. When `commit` is set, accumulated statistics
    /// become the committed range; partial statistics are cleared on every
    /// path.
    pub(crate) fn end_observing(&mut self, commit: bool) -> Result<()> {
        self.observing = false;
        let result = if commit { self.commit_observed() } else { Ok(()) };
        self.analyzer.reset();
        result
    }

    fn commit_observed(&mut self) -> Result<()> {
        // No observed data: leave any previously committed range intact
        let Some((min, max)) = self.analyzer.compute_bounds() else {
            return Ok(());
        };
        let (min, max) = self.finalize_bounds(min, max);
        self.min = Some(min);
        self.max = Some(max);
        Ok(())
    }

    /// Turn observed bounds into a committable range: symmetric mode
    /// recenters around zero, and degenerate ranges are widened to keep
    /// the scale positive.
    fn finalize_bounds(&self, min: Vec<f32>, max: Vec<f32>) -> (Vec<f32>, Vec<f32>) {
        if self.symmetric {
            let pos = ((1i64 << (self.bitwidth - 1)) - 1) as f32;
            let neg = (1i64 << (self.bitwidth - 1)) as f32;
            let mut lo = Vec::with_capacity(min.len());
            let mut hi = Vec::with_capacity(max.len());
            for (l, h) in min.iter().zip(&max) {
                let absmax = l.abs().max(h.abs()).max(1e-10);
                let scale = absmax / pos;
                lo.push(-neg * scale);
                hi.push(pos * scale);
            }
            (lo, hi)
        } else {
            let hi = min
                .iter()
                .zip(&max)
                .map(|(l, h)| if h - l < 1e-10 { l + 1e-10 } else { *h })
                .collect();
            (min, hi)
        }
    }

    fn derive_params(&self, min: &[f32], max: &[f32]) -> (Vec<f32>, Vec<f32>) {
        let num_bins = ((1i64 << self.bitwidth) - 1) as f32;
        let scale: Vec<f32> = min
            .iter()
            .zip(max)
            .map(|(lo, hi)| ((hi - lo) / num_bins).max(1e-20))
            .collect();
        let offset: Vec<f32> = if self.symmetric {
            vec![0.0; min.len()]
        } else {
            let shift = if self.signed {
                (1i64 << (self.bitwidth - 1)) as f32
            } else {
                0.0
            };
            min.iter()
                .zip(&scale)
                .map(|(lo, s)| ste_round(lo / s) + shift)
                .collect()
        };
        (scale, offset)
    }

    fn committed_params(&self) -> Result<(Vec<f32>, Vec<f32>)> {
        match (self.get_scale(), self.get_offset()) {
            (Some(scale), Some(offset)) => Ok((scale, offset)),
            _ => Err(Error::UninitializedQuantizer(self.name.clone())),
        }
    }
}

/// RAII calibration scope. Dropping the scope without [`finish`]
/// restores the quantizer's normal forward behavior and clears partial
/// statistics; [`finish`] additionally commits the accumulated range.
///
/// [`finish`]: CalibrationScope::finish
pub struct CalibrationScope<'a> {
    quantizer: &'a mut MinMaxQuantizer,
    finished: bool,
}

impl CalibrationScope<'_> {
    /// Commit the accumulated statistics as the quantizer's range.
    pub fn finish(mut self) -> Result<()> {
        self.finished = true;
        self.quantizer.end_observing(true)
    }
}

impl Drop for CalibrationScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            // Abandoned scope: restore normal forward, discard statistics
            let _ = self.quantizer.end_observing(false);
        }
    }
}

impl Deref for CalibrationScope<'_> {
    type Target = MinMaxQuantizer;

    fn deref(&self) -> &Self::Target {
        self.quantizer
    }
}

impl DerefMut for CalibrationScope<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.quantizer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::IxDyn;
    use proptest::prelude::*;

    fn tensor1(data: Vec<f32>) -> Tensor {
        Tensor::from_shape_vec(IxDyn(&[data.len()]), data).unwrap()
    }

    #[test]
    fn test_forward_before_calibration_fails() {
        let mut q = MinMaxQuantizer::new("act", 8, false);
        let err = q.forward(&tensor1(vec![1.0])).unwrap_err();
        assert!(matches!(err, Error::UninitializedQuantizer(name) if name == "act"));
    }

    #[test]
    fn test_set_range_validation() {
        let mut q = MinMaxQuantizer::new("act", 8, false);
        assert!(q.set_range(&[0.0, 1.0], &[2.0, 3.0]).is_err(), "wrong length");
        assert!(q.set_range(&[1.0], &[1.0]).is_err(), "min == max");
        assert!(q.set_range(&[2.0], &[1.0]).is_err(), "min > max");
        assert!(q.set_range(&[-1.0], &[1.0]).is_ok());
        assert!(q.is_initialized());
    }

    #[test]
    fn test_asymmetric_calibration_scenario() {
        let mut q = MinMaxQuantizer::new("act", 8, false);
        {
            let mut scope = q.begin_calibration();
            scope
                .forward(&tensor1(vec![-2.0, 0.0, 3.0, 6.0]))
                .unwrap();
            scope.finish().unwrap();
        }

        let scale = q.get_scale().unwrap();
        assert_abs_diff_eq!(scale[0], 8.0 / 255.0, epsilon = 1e-7);

        let offset = q.get_offset().unwrap();
        assert_abs_diff_eq!(offset[0], (-2.0f32 / (8.0 / 255.0)).round(), epsilon = 1e-6);
        assert_abs_diff_eq!(offset[0], -64.0, epsilon = 1e-6);
    }

    #[test]
    fn test_abandoned_scope_restores_and_clears() {
        let mut q = MinMaxQuantizer::new("act", 8, false);
        {
            let mut scope = q.begin_calibration();
            scope.forward(&tensor1(vec![-1.0, 1.0])).unwrap();
            // dropped without finish()
        }
        assert!(!q.is_observing());
        assert!(!q.is_initialized());
        assert!(q.forward(&tensor1(vec![0.5])).is_err());
    }

    #[test]
    fn test_forward_inside_scope_quantizes_dynamically() {
        let mut q = MinMaxQuantizer::new("act", 8, false);
        let mut scope = q.begin_calibration();
        let out = scope.forward(&tensor1(vec![0.0, 1.0, 2.0, 4.0])).unwrap();
        // Values snap to the dynamic grid but stay close to the input
        for (a, b) in [0.0f32, 1.0, 2.0, 4.0].iter().zip(out.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 0.05);
        }
    }

    #[test]
    fn test_recalibrated_min_max_are_consistent() {
        let mut q = MinMaxQuantizer::new("act", 8, false);
        q.set_range(&[-2.0], &[6.0]).unwrap();

        let scale = q.get_scale().unwrap()[0];
        let offset = q.get_offset().unwrap()[0];
        assert_abs_diff_eq!(q.get_min().unwrap()[0], scale * offset, epsilon = 1e-6);
        assert_abs_diff_eq!(
            q.get_max().unwrap()[0],
            scale * (offset + 255.0),
            epsilon = 1e-5
        );
    }

    #[test]
    fn test_per_channel_scales_differ() {
        let mut q = MinMaxQuantizer::per_channel("weight", 8, true, 0, 2);
        let t = Tensor::from_shape_vec(IxDyn(&[2, 2]), vec![1.0, -1.0, 8.0, -8.0]).unwrap();
        {
            let mut scope = q.begin_calibration();
            scope.forward(&t).unwrap();
            scope.finish().unwrap();
        }
        let scale = q.get_scale().unwrap();
        assert_abs_diff_eq!(scale[1] / scale[0], 8.0, epsilon = 1e-4);
    }

    #[test]
    fn test_signed_symmetric_legacy_offset() {
        let mut q = MinMaxQuantizer::new("weight", 8, true);
        {
            let mut scope = q.begin_calibration();
            scope.forward(&tensor1(vec![-1.0, 1.0])).unwrap();
            scope.finish().unwrap();
        }
        let records = q.legacy_encodings().unwrap();
        assert_eq!(records[0].offset, -128);
        assert_eq!(records[0].is_symmetric, "True");
    }

    #[test]
    fn test_calibration_keeps_siblings_independent() {
        let mut a = MinMaxQuantizer::new("a", 8, false);
        let mut b = MinMaxQuantizer::new("b", 8, false);

        let mut scope = a.begin_calibration();
        scope.forward(&tensor1(vec![0.0, 1.0])).unwrap();
        scope.finish().unwrap();

        assert!(a.is_initialized());
        assert!(!b.is_initialized());
        assert!(b.forward(&tensor1(vec![0.0])).is_err());
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(200))]

        /// Symmetric quantizers always derive a zero offset, no matter
        /// what data they observe.
        #[test]
        fn prop_symmetric_offset_always_zero(
            data in prop::collection::vec(-100.0f32..100.0, 1..64),
        ) {
            let mut q = MinMaxQuantizer::new("sym", 8, true);
            {
                let mut scope = q.begin_calibration();
                scope.forward(&tensor1(data)).unwrap();
                scope.finish().unwrap();
            }
            for o in q.get_offset().unwrap() {
                prop_assert_eq!(o, 0.0);
            }
        }

        /// Fake-quantized output never leaves the representable interval.
        #[test]
        fn prop_output_within_representable_range(
            data in prop::collection::vec(-100.0f32..100.0, 1..64),
            calib in prop::collection::vec(-10.0f32..10.0, 2..64),
        ) {
            let mut q = MinMaxQuantizer::new("act", 8, false);
            {
                let mut scope = q.begin_calibration();
                scope.forward(&tensor1(calib)).unwrap();
                scope.finish().unwrap();
            }
            let out = q.forward(&tensor1(data)).unwrap();
            let lo = q.get_min().unwrap()[0];
            let hi = q.get_max().unwrap()[0];
            for v in out.iter() {
                prop_assert!(*v >= lo - 1e-4 && *v <= hi + 1e-4);
            }
        }
    }
}
