//! Calibration statistics for quantization encodings
//!
//! An analyzer accumulates per-block range statistics over the batches
//! seen during a calibration scope:
//! - Min-max: full observed range
//! - Percentile: robust to outliers, bounds from sorted sample percentiles
//! - Moving average: exponentially smoothed min/max across batches

use crate::error::{Error, Result};
use crate::nn::Tensor;
use crate::quant::affine::Granularity;

/// How observed statistics are turned into encoding bounds.
#[derive(Clone, Debug, PartialEq)]
pub enum CalibrationMethod {
    /// Full range of observed values
    MinMax,
    /// Percentile bounds over collected samples (percent values, e.g.
    /// `lower: 1.0, upper: 99.0`)
    Percentile {
        lower: f32,
        upper: f32,
        max_samples: usize,
    },
    /// Exponentially smoothed min/max (`momentum` = weight of the new batch)
    MovingAverage { momentum: f32 },
}

impl Default for CalibrationMethod {
    fn default() -> Self {
        CalibrationMethod::MinMax
    }
}

/// Accumulates calibration statistics for one quantizer.
#[derive(Clone, Debug)]
pub struct EncodingAnalyzer {
    method: CalibrationMethod,
    granularity: Granularity,
    num_blocks: usize,
    running_min: Option<Vec<f32>>,
    running_max: Option<Vec<f32>>,
    samples: Vec<Vec<f32>>,
    num_batches: usize,
}

impl EncodingAnalyzer {
    pub fn new(method: CalibrationMethod, granularity: Granularity, num_blocks: usize) -> Self {
        Self {
            method,
            granularity,
            num_blocks,
            running_min: None,
            running_max: None,
            samples: vec![Vec::new(); num_blocks],
            num_batches: 0,
        }
    }

    pub fn method(&self) -> &CalibrationMethod {
        &self.method
    }

    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    pub fn has_data(&self) -> bool {
        self.num_batches > 0
    }

    /// Observe one batch and return its per-block min/max (used for
    /// dynamic quantization while the calibration scope is active).
    pub fn update_stats(&mut self, tensor: &Tensor) -> Result<(Vec<f32>, Vec<f32>)> {
        let blocks = self.granularity.num_blocks(tensor.shape());
        if blocks != self.num_blocks {
            return Err(Error::ShapeMismatch {
                expected: vec![self.num_blocks],
                got: vec![blocks],
            });
        }

        let (batch_min, batch_max) = block_min_max(tensor, self.granularity, self.num_blocks);

        match self.method.clone() {
            CalibrationMethod::MinMax => self.accumulate_min_max(&batch_min, &batch_max),
            CalibrationMethod::Percentile { max_samples, .. } => {
                self.collect_samples(tensor, max_samples);
                // Min/max tracked as well, as the fallback for sparse data
                self.accumulate_min_max(&batch_min, &batch_max);
            }
            CalibrationMethod::MovingAverage { momentum } => {
                self.accumulate_moving_average(&batch_min, &batch_max, momentum);
            }
        }

        self.num_batches += 1;
        Ok((batch_min, batch_max))
    }

    /// Final per-block bounds from the accumulated statistics, or `None`
    /// if no data was observed.
    pub fn compute_bounds(&self) -> Option<(Vec<f32>, Vec<f32>)> {
        if !self.has_data() {
            return None;
        }
        match &self.method {
            CalibrationMethod::MinMax | CalibrationMethod::MovingAverage { .. } => Some((
                self.running_min.clone()?,
                self.running_max.clone()?,
            )),
            CalibrationMethod::Percentile { lower, upper, .. } => {
                Some(self.percentile_bounds(*lower, *upper))
            }
        }
    }

    /// Clear all accumulated statistics.
    pub fn reset(&mut self) {
        self.running_min = None;
        self.running_max = None;
        for block in &mut self.samples {
            block.clear();
        }
        self.num_batches = 0;
    }

    fn accumulate_min_max(&mut self, batch_min: &[f32], batch_max: &[f32]) {
        match (&mut self.running_min, &mut self.running_max) {
            (Some(min), Some(max)) => {
                for b in 0..self.num_blocks {
                    min[b] = min[b].min(batch_min[b]);
                    max[b] = max[b].max(batch_max[b]);
                }
            }
            _ => {
                self.running_min = Some(batch_min.to_vec());
                self.running_max = Some(batch_max.to_vec());
            }
        }
    }

    fn accumulate_moving_average(&mut self, batch_min: &[f32], batch_max: &[f32], momentum: f32) {
        match (&mut self.running_min, &mut self.running_max) {
            (Some(min), Some(max)) => {
                for b in 0..self.num_blocks {
                    min[b] = min[b] * (1.0 - momentum) + batch_min[b] * momentum;
                    max[b] = max[b] * (1.0 - momentum) + batch_max[b] * momentum;
                }
            }
            _ => {
                self.running_min = Some(batch_min.to_vec());
                self.running_max = Some(batch_max.to_vec());
            }
        }
    }

    fn collect_samples(&mut self, tensor: &Tensor, max_samples: usize) {
        match self.granularity {
            Granularity::PerTensor => {
                let remaining = max_samples.saturating_sub(self.samples[0].len());
                self.samples[0].extend(tensor.iter().take(remaining));
            }
            Granularity::PerChannel { axis } => {
                for (idx, v) in tensor.indexed_iter() {
                    let block = idx[axis];
                    if self.samples[block].len() < max_samples {
                        self.samples[block].push(*v);
                    }
                }
            }
        }
    }

    fn percentile_bounds(&self, lower: f32, upper: f32) -> (Vec<f32>, Vec<f32>) {
        let mut mins = Vec::with_capacity(self.num_blocks);
        let mut maxs = Vec::with_capacity(self.num_blocks);
        for b in 0..self.num_blocks {
            if self.samples[b].is_empty() {
                mins.push(self.running_min.as_ref().map_or(0.0, |m| m[b]));
                maxs.push(self.running_max.as_ref().map_or(0.0, |m| m[b]));
                continue;
            }
            let mut sorted = self.samples[b].clone();
            sorted.sort_by(|a, b| a.total_cmp(b));
            let n = sorted.len();
            let lower_idx = ((lower / 100.0) * n as f32) as usize;
            let upper_idx = (((upper / 100.0) * n as f32) as usize).min(n - 1);
            mins.push(sorted[lower_idx]);
            maxs.push(sorted[upper_idx]);
        }
        (mins, maxs)
    }
}

fn block_min_max(
    tensor: &Tensor,
    granularity: Granularity,
    num_blocks: usize,
) -> (Vec<f32>, Vec<f32>) {
    let mut mins = vec![f32::INFINITY; num_blocks];
    let mut maxs = vec![f32::NEG_INFINITY; num_blocks];
    match granularity {
        Granularity::PerTensor => {
            for v in tensor.iter() {
                mins[0] = mins[0].min(*v);
                maxs[0] = maxs[0].max(*v);
            }
        }
        Granularity::PerChannel { axis } => {
            for (idx, v) in tensor.indexed_iter() {
                let b = idx[axis];
                mins[b] = mins[b].min(*v);
                maxs[b] = maxs[b].max(*v);
            }
        }
    }
    (mins, maxs)
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
    fn test_min_max_accumulates_across_batches() {
        let mut analyzer = EncodingAnalyzer::new(CalibrationMethod::MinMax, Granularity::PerTensor, 1);

        analyzer.update_stats(&tensor1(vec![0.0, 1.0, -1.0])).unwrap();
        analyzer.update_stats(&tensor1(vec![0.5, 3.0, -2.0])).unwrap();

        let (min, max) = analyzer.compute_bounds().unwrap();
        assert_abs_diff_eq!(min[0], -2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(max[0], 3.0, epsilon = 1e-6);
        assert_eq!(analyzer.num_batches(), 2);
    }

    #[test]
    fn test_per_channel_blocks_tracked_independently() {
        let mut analyzer = EncodingAnalyzer::new(
            CalibrationMethod::MinMax,
            Granularity::PerChannel { axis: 0 },
            2,
        );
        let t = Tensor::from_shape_vec(IxDyn(&[2, 2]), vec![1.0, 2.0, -5.0, 5.0]).unwrap();
        analyzer.update_stats(&t).unwrap();

        let (min, max) = analyzer.compute_bounds().unwrap();
        assert_abs_diff_eq!(min[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(max[0], 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(min[1], -5.0, epsilon = 1e-6);
        assert_abs_diff_eq!(max[1], 5.0, epsilon = 1e-6);
    }

    #[test]
    fn test_block_count_mismatch_rejected() {
        let mut analyzer = EncodingAnalyzer::new(
            CalibrationMethod::MinMax,
            Granularity::PerChannel { axis: 0 },
            2,
        );
        let t = Tensor::from_shape_vec(IxDyn(&[3, 1]), vec![0.0; 3]).unwrap();
        assert!(analyzer.update_stats(&t).is_err());
    }

    #[test]
    fn test_percentile_ignores_outliers() {
        let mut data: Vec<f32> = (0..100).map(|i| i as f32 * 0.1).collect();
        data.push(1000.0);
        data.push(-1000.0);

        let mut analyzer = EncodingAnalyzer::new(
            CalibrationMethod::Percentile {
                lower: 1.0,
                upper: 99.0,
                max_samples: 1024,
            },
            Granularity::PerTensor,
            1,
        );
        analyzer.update_stats(&tensor1(data)).unwrap();

        let (min, max) = analyzer.compute_bounds().unwrap();
        assert!(min[0] > -100.0, "negative outlier should be dropped");
        assert!(max[0] < 100.0, "positive outlier should be dropped");
    }

    #[test]
    fn test_moving_average_smooths_bounds() {
        let mut analyzer = EncodingAnalyzer::new(
            CalibrationMethod::MovingAverage { momentum: 0.5 },
            Granularity::PerTensor,
            1,
        );

        analyzer.update_stats(&tensor1(vec![0.0, 1.0, -1.0])).unwrap();
        analyzer.update_stats(&tensor1(vec![0.0, 2.0, -2.0])).unwrap();

        let (min, max) = analyzer.compute_bounds().unwrap();
        assert_abs_diff_eq!(min[0], -1.5, epsilon = 1e-5);
        assert_abs_diff_eq!(max[0], 1.5, epsilon = 1e-5);
    }

    #[test]
    fn test_reset_clears_statistics() {
        let mut analyzer = EncodingAnalyzer::new(CalibrationMethod::MinMax, Granularity::PerTensor, 1);
        analyzer.update_stats(&tensor1(vec![1.0, 2.0])).unwrap();
        assert!(analyzer.has_data());

        analyzer.reset();
        assert!(!analyzer.has_data());
        assert!(analyzer.compute_bounds().is_none());
    }

    proptest! {
        /// Min-max bounds always bracket every observed value.
        #[test]
        fn prop_bounds_bracket_observations(
            batch1 in prop::collection::vec(-50.0f32..50.0, 1..40),
            batch2 in prop::collection::vec(-50.0f32..50.0, 1..40),
        ) {
            let mut analyzer =
                EncodingAnalyzer::new(CalibrationMethod::MinMax, Granularity::PerTensor, 1);
            analyzer.update_stats(&tensor1(batch1.clone())).unwrap();
            analyzer.update_stats(&tensor1(batch2.clone())).unwrap();

            let (min, max) = analyzer.compute_bounds().unwrap();
            for v in batch1.iter().chain(batch2.iter()) {
                prop_assert!(min[0] <= *v && *v <= max[0]);
            }
        }
    }
}
