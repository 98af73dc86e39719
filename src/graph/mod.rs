//! Connected graph construction
//!
//! Reconstructs a static, addressable dataflow graph from a traced model
//! execution. The graph has two kinds of entities: operations ([`Op`]),
//! representing a module invocation or functional application, and
//! products ([`Product`]), representing tensors flowing between
//! operations (or entering the model as inputs and parameters). The
//! representation is bidirectional: ops know their input products, and
//! products know their producer and consumers.
//!
//! Construction consumes a [`TraceGraph`] (the instruction-level trace a
//! host framework produces) together with one concrete example input,
//! and handles multi-output modules (tuple packing/unpacking), implicit
//! tensor fan-out (synthesized Split ops) and shape inference with
//! partial information.

mod builder;
mod connected;
mod op;
mod product;
mod trace;

pub use builder::GraphBuilder;
pub use connected::ConnectedGraph;
pub use op::Op;
pub use product::Product;
pub use trace::{execute, execute_with, ShapeMap, ShapeRecord, TraceGraph, TracedInstruction, Value};
