//! Affine quantization
//!
//! Simulated fixed-point quantization for floating-point tensors:
//! - Pure affine encoding math (quantize, dequantize, range derivation)
//! - Encoding analyzers that accumulate calibration statistics
//!   (min-max, percentile, moving average)
//! - A stateful min-max quantizer with a scoped calibration mode and
//!   legacy encoding export

mod affine;
mod analyzer;
mod encoding;
mod quantizer;

pub use affine::{
    dequantize, quant_range, quantize, quantize_dequantize, ste_backward, ste_round, Granularity,
};
pub use analyzer::{CalibrationMethod, EncodingAnalyzer};
pub use encoding::{AffineEncoding, EncodingRecord};
pub use quantizer::{CalibrationScope, MinMaxQuantizer};
