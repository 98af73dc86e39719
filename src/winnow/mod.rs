//! Channel winnowing
//!
//! Structural pruning of channels from a model's layers, propagated
//! consistently across the connected graph:
//! - Binary mask primitives (positions, overlap, running winnowed masks)
//! - A static op-type → connectivity table describing how each op
//!   propagates a channel mask
//! - The mask propagation engine, which turns per-op winnow requests
//!   into consistent input/output masks for every affected op
//! - The module reducer, which physically rebuilds parameter tensors
//!   from the kept channel indices

mod connectivity;
mod mask;
mod propagate;
mod reduce;

pub use connectivity::{ConnectivityType, OpConnectivity};
pub use mask::{one_positions, overlap_indices, update_winnowed_mask, zero_positions, Mask};
pub use propagate::{propagate_masks, OpMasks, WinnowPlan};
pub use reduce::ModuleReducer;
