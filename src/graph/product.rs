//! Graph product edge

/// A directed edge binding one tensor to the ops that produce and
/// consume it.
///
/// A product has at most one producer; model inputs, constants and
/// parameters have none. Parameter products never have a producer.
#[derive(Clone, Debug)]
pub struct Product {
    pub name: String,
    pub shape: Option<Vec<usize>>,
    /// Producing op name, absent for model inputs and parameters
    pub producer: Option<String>,
    /// Consuming op names, in consumption order
    pub consumers: Vec<String>,
    pub is_model_input: bool,
    pub is_parameter: bool,
}

impl Product {
    pub fn new(name: impl Into<String>, shape: Option<Vec<usize>>) -> Self {
        Self {
            name: name.into(),
            shape,
            producer: None,
            consumers: Vec::new(),
            is_model_input: false,
            is_parameter: false,
        }
    }

    pub fn add_consumer(&mut self, op_name: impl Into<String>) {
        self.consumers.push(op_name.into());
    }
}
