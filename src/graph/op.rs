//! Graph operation node

use crate::nn::ModuleId;

/// A computation node: one module invocation or one functional
/// application from the traced forward pass.
///
/// Every non-functional op resolves to exactly one owning module;
/// functional and synthesized ops (e.g. Split) have no module and are
/// anonymous.
#[derive(Clone, Debug)]
pub struct Op {
    /// Unique name within the graph, e.g. `convolution_0`
    pub name: String,
    /// Human-readable dotted path, e.g. `Net.block.conv1`
    pub dotted_name: String,
    /// Normalized op-type tag, e.g. `convolution`, `batch_norm`, `add`
    pub op_type: String,
    pub input_shape: Option<Vec<usize>>,
    pub output_shape: Option<Vec<usize>>,
    /// Group count for grouped convolution, 1 otherwise
    pub groups: usize,
    /// Owning module, absent for functional/anonymous ops
    pub module: Option<ModuleId>,
    /// Input product names, ordered as consumed
    pub inputs: Vec<String>,
    /// Output product name, if any consumer exists
    pub output: Option<String>,
    pub is_anonymous: bool,
}

impl Op {
    pub fn new(name: impl Into<String>, dotted_name: impl Into<String>, op_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dotted_name: dotted_name.into(),
            op_type: op_type.into(),
            input_shape: None,
            output_shape: None,
            groups: 1,
            module: None,
            inputs: Vec::new(),
            output: None,
            is_anonymous: false,
        }
    }

    /// True when no module owns this op.
    pub fn is_functional(&self) -> bool {
        self.module.is_none()
    }

    pub fn add_input(&mut self, product_name: impl Into<String>) {
        self.inputs.push(product_name.into());
    }
}
