//! # Cuantizar: Model Quantization Toolkit
//!
//! Cuantizar takes a traced floating-point model, reconstructs a connected
//! dataflow graph from the trace, and inserts simulated fixed-point
//! ("fake-quant") operators whose ranges are calibrated from sample data.
//! The calibrated encodings (scale/offset/bitwidth) can be exported for a
//! target inference runtime. The same connected graph drives channel
//! winnowing: structural pruning propagated consistently across the model.
//!
//! ## Architecture
//!
//! - **nn**: Minimal layer substrate and module registry (stand-in for the
//!   host tensor framework)
//! - **graph**: Op/Product entity model, trace instruction set, and the
//!   connected graph builder
//! - **winnow**: Binary channel masks, connectivity rules and module
//!   reduction
//! - **quant**: Affine encoding math, encoding analyzers and the min-max
//!   quantizer
//! - **wrap**: Quantization wrappers (fake-quant and true-quant dispatch)
//! - **sim**: Calibration orchestration and encoding export

pub mod graph;
pub mod nn;
pub mod quant;
pub mod sim;
pub mod winnow;
pub mod wrap;

pub mod error;

// Re-export commonly used types
pub use error::{Error, Result};
pub use graph::{ConnectedGraph, GraphBuilder, Op, Product, TraceGraph, TracedInstruction};
pub use nn::{Layer, ModuleId, ModuleRegistry, Tensor};
pub use quant::{AffineEncoding, Granularity, MinMaxQuantizer};
pub use sim::{QuantSim, QuantSimConfig};
