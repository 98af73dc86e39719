//! Pure affine encoding math
//!
//! The quantization grid is defined by a scale, an offset and an integer
//! range `[qmin, qmax]` derived from bitwidth and signedness:
//!
//! ```text
//! x_int         = clamp(round(x / scale) - offset, qmin, qmax)
//! quantize(x)   = x_int
//! dequantize(q) = (q + offset) * scale
//! ```
//!
//! All functions operate per element, optionally per block along one axis
//! for per-channel quantization.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::nn::Tensor;

/// Block structure of the quantization parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Granularity {
    /// Single scale/offset for the entire tensor
    #[default]
    PerTensor,
    /// Separate scale/offset per channel along the given axis
    PerChannel { axis: usize },
}

impl Granularity {
    /// Number of parameter blocks for a tensor of the given shape.
    pub fn num_blocks(&self, shape: &[usize]) -> usize {
        match self {
            Granularity::PerTensor => 1,
            Granularity::PerChannel { axis } => shape[*axis],
        }
    }
}

/// Integer range `[qmin, qmax]` for a bitwidth.
///
/// Unsigned maps to `[0, 2^bw - 1]`; signed maps to
/// `[-ceil((2^bw - 1) / 2), floor((2^bw - 1) / 2)]`.
pub fn quant_range(bitwidth: u32, signed: bool) -> (i64, i64) {
    let num_bins = (1i64 << bitwidth) - 1;
    if signed {
        (-((num_bins + 1) / 2), num_bins / 2)
    } else {
        (0, num_bins)
    }
}

/// Round to nearest with a straight-through estimator gradient contract:
/// the forward pass rounds, the backward pass is the identity. The
/// backward half lives in [`ste_backward`].
pub fn ste_round(x: f32) -> f32 {
    x.round()
}

/// Straight-through estimator backward pass: gradients flow unchanged
/// through the rounding operation.
pub fn ste_backward(grad_output: &Tensor) -> Tensor {
    grad_output.clone()
}

fn validate_params(
    shape: &[usize],
    scale: &[f32],
    offset: &[f32],
    granularity: Granularity,
) -> Result<()> {
    let blocks = granularity.num_blocks(shape);
    if scale.len() != blocks || offset.len() != blocks {
        return Err(Error::EncodingValidation(format!(
            "expected {} scale/offset blocks for shape {:?}, got {}/{}",
            blocks,
            shape,
            scale.len(),
            offset.len()
        )));
    }
    if let Some(s) = scale.iter().find(|s| **s <= 0.0) {
        return Err(Error::EncodingValidation(format!(
            "scale must be positive, got {s}"
        )));
    }
    Ok(())
}

fn map_blocks<F>(tensor: &Tensor, granularity: Granularity, f: F) -> Tensor
where
    F: Fn(usize, f32) -> f32,
{
    let mut out = tensor.clone();
    match granularity {
        Granularity::PerTensor => out.mapv_inplace(|v| f(0, v)),
        Granularity::PerChannel { axis } => {
            for (idx, v) in out.indexed_iter_mut() {
                *v = f(idx[axis], *v);
            }
        }
    }
    out
}

/// Quantize a tensor onto the integer grid. The result holds
/// integer-valued floats in `[qmin, qmax]`.
pub fn quantize(
    tensor: &Tensor,
    scale: &[f32],
    offset: &[f32],
    qmin: i64,
    qmax: i64,
    granularity: Granularity,
) -> Result<Tensor> {
    validate_params(tensor.shape(), scale, offset, granularity)?;
    Ok(map_blocks(tensor, granularity, |b, x| {
        (ste_round(x / scale[b]) - offset[b]).clamp(qmin as f32, qmax as f32)
    }))
}

/// Map integer-valued quantized data back to floating point.
pub fn dequantize(
    tensor: &Tensor,
    scale: &[f32],
    offset: &[f32],
    granularity: Granularity,
) -> Result<Tensor> {
    let blocks = granularity.num_blocks(tensor.shape());
    if scale.len() != blocks || offset.len() != blocks {
        return Err(Error::EncodingValidation(format!(
            "expected {} scale/offset blocks for shape {:?}, got {}/{}",
            blocks,
            tensor.shape(),
            scale.len(),
            offset.len()
        )));
    }
    Ok(map_blocks(tensor, granularity, |b, q| {
        (q + offset[b]) * scale[b]
    }))
}

/// Fake-quantize: quantize then immediately dequantize, simulating the
/// quantization grid while staying in floating point.
pub fn quantize_dequantize(
    tensor: &Tensor,
    scale: &[f32],
    offset: &[f32],
    qmin: i64,
    qmax: i64,
    granularity: Granularity,
) -> Result<Tensor> {
    validate_params(tensor.shape(), scale, offset, granularity)?;
    Ok(map_blocks(tensor, granularity, |b, x| {
        let q = (ste_round(x / scale[b]) - offset[b]).clamp(qmin as f32, qmax as f32);
        (q + offset[b]) * scale[b]
    }))
}
