//! True-quantized kernel dispatch
//!
//! Instead of simulating quantization in floating point, a true-quant
//! wrapper hands integer-valued tensors to operator kernels supplied by
//! pluggable backend libraries. For each call, backend-declared
//! (predicate, kernel) pairs are evaluated in priority order — explicit
//! per-layer backends first, then the default backends of the
//! [`BackendConfig`] — and the first kernel whose predicate accepts the
//! arguments is invoked. If none match, a float fallback runs the
//! fake-quant forward path, or the call fails if fallback is disallowed.

use std::rc::Rc;

use crate::error::{Error, Result};
use crate::nn::{ModuleRegistry, Tensor};
use crate::quant::AffineEncoding;
use crate::wrap::QuantWrapper;

/// Arguments offered to a kernel: quantized inputs and parameters plus
/// the encodings the outputs must carry.
pub struct KernelArgs<'a> {
    pub op_key: &'a str,
    pub inputs: &'a [Tensor],
    pub params: &'a [(String, Tensor)],
    pub output_encodings: &'a [Option<AffineEncoding>],
}

/// One (predicate, operator) pair of a backend library.
pub trait Kernel {
    /// True when the kernel can evaluate the given arguments.
    fn matches(&self, args: &KernelArgs<'_>) -> bool;
    /// Evaluate. Only called after [`matches`] accepted the arguments.
    ///
    /// [`matches`]: Kernel::matches
    fn invoke(&self, args: &KernelArgs<'_>) -> Result<Vec<Tensor>>;
}

/// An integer operator library: an ordered list of kernels per op key.
pub trait KernelLibrary {
    fn kernels(&self, op_key: &str) -> Vec<&dyn Kernel>;
}

/// Backend selection, threaded through construction instead of living
/// in process-wide state.
#[derive(Clone, Default)]
pub struct BackendConfig {
    /// Default libraries consulted after any per-layer backends
    pub default_backends: Vec<Rc<dyn KernelLibrary>>,
    /// Run the float forward path and requantize when no kernel matches
    pub allow_float_fallback: bool,
}

/// A quantization wrapper dispatching to integer kernels.
pub struct TrueQuantWrapper {
    pub wrapper: QuantWrapper,
    op_key: String,
    layer_backends: Vec<Rc<dyn KernelLibrary>>,
    config: BackendConfig,
}

impl TrueQuantWrapper {
    pub fn new(wrapper: QuantWrapper, op_key: impl Into<String>, config: BackendConfig) -> Self {
        Self {
            wrapper,
            op_key: op_key.into(),
            layer_backends: Vec::new(),
            config,
        }
    }

    /// Explicit backends for this layer, consulted before the defaults.
    pub fn set_layer_backends(&mut self, backends: Vec<Rc<dyn KernelLibrary>>) {
        self.layer_backends = backends;
    }

    /// All libraries in priority order.
    fn available_backends(&self) -> impl Iterator<Item = &Rc<dyn KernelLibrary>> {
        self.layer_backends
            .iter()
            .chain(self.config.default_backends.iter())
    }

    /// Dispatch to the first kernel whose predicate accepts the
    /// quantized arguments.
    pub fn forward(
        &mut self,
        registry: &mut ModuleRegistry,
        inputs: &[Tensor],
    ) -> Result<Vec<Tensor>> {
        self.wrapper.compute_param_encodings(registry, false)?;

        let mut quantized_inputs = Vec::with_capacity(inputs.len());
        for (index, input) in inputs.iter().enumerate() {
            match self
                .wrapper
                .input_quantizers
                .get(index)
                .and_then(|q| q.as_ref())
            {
                Some(quantizer) => quantized_inputs.push(quantizer.quantize(input)?),
                None => quantized_inputs.push(input.clone()),
            }
        }

        let layer = registry.leaf(self.wrapper.module()).ok_or_else(|| {
            Error::Structural(format!("module '{}' is not a leaf", self.wrapper.dotted_name()))
        })?;
        let mut params = Vec::new();
        for (name, quantizer) in &self.wrapper.param_quantizers {
            if let Some(param) = layer.parameter(name) {
                params.push((name.clone(), quantizer.quantize(param)?));
            }
        }
        let output_encodings: Vec<Option<AffineEncoding>> = self
            .wrapper
            .output_quantizers
            .iter()
            .map(|q| q.as_ref().and_then(|q| q.encoding()))
            .collect();

        let args = KernelArgs {
            op_key: &self.op_key,
            inputs: &quantized_inputs,
            params: &params,
            output_encodings: &output_encodings,
        };

        for backend in self.available_backends() {
            for kernel in backend.kernels(&self.op_key) {
                if kernel.matches(&args) {
                    return kernel.invoke(&args);
                }
            }
        }

        if self.config.allow_float_fallback {
            return self.wrapper.forward(registry, inputs);
        }
        let shapes: Vec<Vec<usize>> = quantized_inputs.iter().map(|t| t.shape().to_vec()).collect();
        Err(Error::NoCompatibleKernel {
            op_key: self.op_key.clone(),
            details: format!("input shapes {shapes:?}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{Layer, Linear};
    use crate::wrap::{QuantSimConfig, WrapperRegistry};
    use ndarray::IxDyn;
    use std::cell::Cell;

    struct MarkerKernel {
        accept: bool,
        marker: f32,
        hits: Rc<Cell<usize>>,
    }

    impl Kernel for MarkerKernel {
        fn matches(&self, _args: &KernelArgs<'_>) -> bool {
            self.accept
        }

        fn invoke(&self, args: &KernelArgs<'_>) -> Result<Vec<Tensor>> {
            self.hits.set(self.hits.get() + 1);
            Ok(vec![Tensor::from_elem(
                IxDyn(args.inputs[0].shape()),
                self.marker,
            )])
        }
    }

    struct SingleKernelLibrary {
        kernel: MarkerKernel,
    }

    impl KernelLibrary for SingleKernelLibrary {
        fn kernels(&self, op_key: &str) -> Vec<&dyn Kernel> {
            if op_key == "linear" {
                vec![&self.kernel]
            } else {
                Vec::new()
            }
        }
    }

    fn library(accept: bool, marker: f32, hits: Rc<Cell<usize>>) -> Rc<dyn KernelLibrary> {
        Rc::new(SingleKernelLibrary {
            kernel: MarkerKernel {
                accept,
                marker,
                hits,
            },
        })
    }

    fn fixture(config: BackendConfig) -> (ModuleRegistry, TrueQuantWrapper) {
        let mut registry = ModuleRegistry::new("Net");
        let id = registry.add_leaf(registry.root(), "fc", Layer::Linear(Linear::new(2, 2)));
        let spec = WrapperRegistry::standard().spec("addmm").unwrap().clone();
        let mut wrapper = QuantWrapper::new(
            id,
            "Net.fc",
            registry.leaf(id).unwrap(),
            &spec,
            &QuantSimConfig::default(),
        );
        wrapper
            .output_quantizers[0]
            .as_mut()
            .unwrap()
            .set_range(&[-4.0], &[4.0])
            .unwrap();
        (registry, TrueQuantWrapper::new(wrapper, "linear", config))
    }

    fn x() -> Tensor {
        Tensor::from_shape_vec(IxDyn(&[1, 2]), vec![0.5, 1.0]).unwrap()
    }

    #[test]
    fn test_first_matching_kernel_wins() {
        let first_hits = Rc::new(Cell::new(0));
        let second_hits = Rc::new(Cell::new(0));
        let config = BackendConfig {
            default_backends: vec![
                library(true, 1.0, first_hits.clone()),
                library(true, 2.0, second_hits.clone()),
            ],
            allow_float_fallback: false,
        };
        let (mut registry, mut wrapper) = fixture(config);

        let out = wrapper.forward(&mut registry, &[x()]).unwrap();
        assert_eq!(out[0][[0, 0]], 1.0);
        assert_eq!(first_hits.get(), 1);
        assert_eq!(second_hits.get(), 0);
    }

    #[test]
    fn test_layer_backends_take_priority_over_defaults() {
        let layer_hits = Rc::new(Cell::new(0));
        let default_hits = Rc::new(Cell::new(0));
        let config = BackendConfig {
            default_backends: vec![library(true, 2.0, default_hits.clone())],
            allow_float_fallback: false,
        };
        let (mut registry, mut wrapper) = fixture(config);
        wrapper.set_layer_backends(vec![library(true, 1.0, layer_hits.clone())]);

        let out = wrapper.forward(&mut registry, &[x()]).unwrap();
        assert_eq!(out[0][[0, 0]], 1.0);
        assert_eq!(layer_hits.get(), 1);
        assert_eq!(default_hits.get(), 0);
    }

    #[test]
    fn test_rejecting_predicates_fall_through() {
        let hits = Rc::new(Cell::new(0));
        let config = BackendConfig {
            default_backends: vec![
                library(false, 1.0, hits.clone()),
                library(true, 2.0, hits.clone()),
            ],
            allow_float_fallback: false,
        };
        let (mut registry, mut wrapper) = fixture(config);

        let out = wrapper.forward(&mut registry, &[x()]).unwrap();
        assert_eq!(out[0][[0, 0]], 2.0);
    }

    #[test]
    fn test_no_kernel_and_no_fallback_fails() {
        let hits = Rc::new(Cell::new(0));
        let config = BackendConfig {
            default_backends: vec![library(false, 1.0, hits)],
            allow_float_fallback: false,
        };
        let (mut registry, mut wrapper) = fixture(config);

        let err = wrapper.forward(&mut registry, &[x()]).unwrap_err();
        match err {
            Error::NoCompatibleKernel { op_key, details } => {
                assert_eq!(op_key, "linear");
                assert!(details.contains("[1, 2]"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_float_fallback_runs_fake_quant_path() {
        let config = BackendConfig {
            default_backends: Vec::new(),
            allow_float_fallback: true,
        };
        let (mut registry, mut wrapper) = fixture(config);

        let out = wrapper.forward(&mut registry, &[x()]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].shape(), &[1, 2]);
    }
}
