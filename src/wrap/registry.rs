//! Wrapper specification registry
//!
//! Maps each layer kind to the wrapper layout (input/output arity and
//! which parameters get quantizers). The registry is built once and is
//! write-once per key: registering a kind twice returns the existing
//! specification instead of duplicating it.

use std::collections::HashMap;

/// Wrapper layout for one layer kind.
#[derive(Clone, Debug)]
pub struct WrapperSpec {
    pub num_inputs: usize,
    pub num_outputs: usize,
    /// Parameter names that receive quantizers
    pub quantized_params: &'static [&'static str],
}

impl WrapperSpec {
    pub fn activation_only() -> Self {
        Self {
            num_inputs: 1,
            num_outputs: 1,
            quantized_params: &[],
        }
    }

    pub fn weighted() -> Self {
        Self {
            num_inputs: 1,
            num_outputs: 1,
            quantized_params: &["weight", "bias"],
        }
    }
}

/// Registry of wrapper specifications, keyed by layer kind.
pub struct WrapperRegistry {
    specs: HashMap<String, WrapperSpec>,
}

impl WrapperRegistry {
    pub fn empty() -> Self {
        Self {
            specs: HashMap::new(),
        }
    }

    /// The standard registrations for every built-in layer kind.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register("convolution", WrapperSpec::weighted());
        registry.register("addmm", WrapperSpec::weighted());
        // Batch norm folds into the preceding conv at export time; its
        // parameters are not independently quantized
        registry.register("batch_norm", WrapperSpec::activation_only());
        registry.register("relu", WrapperSpec::activation_only());
        registry.register("max_pool2d", WrapperSpec::activation_only());
        registry.register("index_select", WrapperSpec::activation_only());
        registry
    }

    /// Register a wrapper spec for a layer kind. Registering the same
    /// kind twice returns the existing registration.
    pub fn register(&mut self, kind: &str, spec: WrapperSpec) -> &WrapperSpec {
        self.specs.entry(kind.to_string()).or_insert(spec)
    }

    pub fn spec(&self, kind: &str) -> Option<&WrapperSpec> {
        self.specs.get(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_covers_builtin_kinds() {
        let registry = WrapperRegistry::standard();
        assert_eq!(registry.spec("convolution").unwrap().quantized_params, &["weight", "bias"]);
        assert!(registry.spec("relu").unwrap().quantized_params.is_empty());
        assert!(registry.spec("mystery").is_none());
    }

    #[test]
    fn test_register_twice_returns_existing() {
        let mut registry = WrapperRegistry::empty();
        registry.register("custom", WrapperSpec::activation_only());

        // A second registration must not replace the first
        let spec = registry.register(
            "custom",
            WrapperSpec {
                num_inputs: 7,
                num_outputs: 7,
                quantized_params: &["weight"],
            },
        );
        assert_eq!(spec.num_inputs, 1);
        assert_eq!(registry.spec("custom").unwrap().num_outputs, 1);
    }
}
