//! Error types for Cuantizar

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed trace, unresolved module reference or duplicate op binding.
    /// The graph would be unsound, so these are never retried.
    #[error("Structural error: {0}")]
    Structural(String),

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error(
        "Quantizer '{0}' is not initialized. \
         Initialize the quantization parameters with a calibration scope first"
    )]
    UninitializedQuantizer(String),

    #[error("Invalid encoding range: {0}")]
    EncodingValidation(String),

    #[error("Mask propagation failed: {0}")]
    MaskPropagation(String),

    #[error("No compatible operator found for '{op_key}' with arguments: {details}")]
    NoCompatibleKernel { op_key: String, details: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
