//! Op connectivity classification
//!
//! Describes how each op type propagates a channel mask from input to
//! output. The table is keyed by the normalized op-type vocabulary the
//! connected graph emits; unrecognized op types deliberately return no
//! classification so that mask propagation fails loudly instead of
//! passing through silently.

/// How an op propagates a channel mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectivityType {
    /// The op defines its own independent output channel set
    /// (convolution, linear); propagation terminates here
    Null,
    /// The mask passes through unchanged
    Direct,
    /// All input masks must be identical; the output mask equals them
    Add,
    /// The output mask is the ordered concatenation of the input masks
    Concat,
    /// A single input mask is distributed to every consumer
    Split,
    /// Transparent to mask propagation; consumers see through the op
    Skip,
}

/// Static lookup of op connectivity. Meant to be used statically, not
/// instantiated.
pub struct OpConnectivity;

impl OpConnectivity {
    /// Connectivity for an op type, or `None` if the type is not
    /// recognized. Callers must treat `None` as a propagation-blocking
    /// error.
    pub fn get(op_type: &str) -> Option<ConnectivityType> {
        let connectivity = match op_type {
            "convolution" | "addmm" | "matmul" | "index_select" => ConnectivityType::Null,
            "batch_norm" | "relu" | "log_softmax" | "max_pool2d" | "avg_pool2d"
            | "adaptive_avg_pool2d" | "feature_dropout" | "dropout" | "hardtanh" | "mean"
            | "floor" | "upsample_nearest2d" | "upsample_bilinear2d" => ConnectivityType::Direct,
            "cat" => ConnectivityType::Concat,
            "add" => ConnectivityType::Add,
            "Split" => ConnectivityType::Split,
            "size" | "NumToTensor" | "mul" | "view" | "reshape" | "flatten" | "slice"
            | "unsqueeze" | "select" => ConnectivityType::Skip,
            _ => return None,
        };
        Some(connectivity)
    }
}
