//! Quantization wrappers
//!
//! A [`QuantWrapper`] composes a leaf layer with input, output and
//! parameter quantizers. On every forward call it lazily computes
//! parameter encodings, fake-quantizes inputs, substitutes quantized
//! parameter values for the duration of the wrapped call (restored on
//! every exit path), runs the layer, and fake-quantizes outputs.
//!
//! The mapping from layer kind to wrapper layout lives in a write-once
//! [`WrapperRegistry`]; true-quantized dispatch to integer kernels is in
//! [`backend`].

mod backend;
mod registry;

pub use backend::{BackendConfig, Kernel, KernelArgs, KernelLibrary, TrueQuantWrapper};
pub use registry::{WrapperRegistry, WrapperSpec};

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::nn::{Layer, ModuleId, ModuleRegistry, Tensor};
use crate::quant::{CalibrationMethod, MinMaxQuantizer};

/// Quantizer layout and numerics applied when wrapping modules.
#[derive(Clone, Debug)]
pub struct QuantSimConfig {
    pub activation_bitwidth: u32,
    pub param_bitwidth: u32,
    pub symmetric_activations: bool,
    pub symmetric_params: bool,
    pub per_channel_params: bool,
    /// Input quantizers are disabled by default; inputs are assumed
    /// already quantized by the producing layer's output quantizer
    pub quantize_inputs: bool,
    pub quantize_outputs: bool,
    pub method: CalibrationMethod,
}

impl Default for QuantSimConfig {
    fn default() -> Self {
        Self {
            activation_bitwidth: 8,
            param_bitwidth: 8,
            symmetric_activations: false,
            symmetric_params: true,
            per_channel_params: false,
            quantize_inputs: false,
            quantize_outputs: true,
            method: CalibrationMethod::MinMax,
        }
    }
}

/// A leaf layer composed with its quantizers.
pub struct QuantWrapper {
    module: ModuleId,
    dotted_name: String,
    pub input_quantizers: Vec<Option<MinMaxQuantizer>>,
    pub output_quantizers: Vec<Option<MinMaxQuantizer>>,
    pub param_quantizers: BTreeMap<String, MinMaxQuantizer>,
}

impl QuantWrapper {
    pub fn new(
        module: ModuleId,
        dotted_name: &str,
        layer: &Layer,
        spec: &WrapperSpec,
        config: &QuantSimConfig,
    ) -> Self {
        let make_activation = |index: usize, kind: &str, enabled: bool| {
            enabled.then(|| {
                MinMaxQuantizer::new(
                    format!("{dotted_name}.{kind}.{index}"),
                    config.activation_bitwidth,
                    config.symmetric_activations,
                )
                .with_method(config.method.clone())
            })
        };

        let input_quantizers = (0..spec.num_inputs)
            .map(|i| make_activation(i, "input", config.quantize_inputs))
            .collect();
        let output_quantizers = (0..spec.num_outputs)
            .map(|i| make_activation(i, "output", config.quantize_outputs))
            .collect();

        let mut param_quantizers = BTreeMap::new();
        for name in spec.quantized_params {
            let Some(param) = layer.parameter(name) else { continue };
            let quantizer_name = format!("{dotted_name}.{name}");
            // Per-channel quantization applies to the weight along its
            // output-channel axis; other parameters stay per-tensor
            let quantizer = if config.per_channel_params && *name == "weight" {
                MinMaxQuantizer::per_channel(
                    quantizer_name,
                    config.param_bitwidth,
                    config.symmetric_params,
                    0,
                    param.shape()[0],
                )
            } else {
                MinMaxQuantizer::new(
                    quantizer_name,
                    config.param_bitwidth,
                    config.symmetric_params,
                )
            };
            param_quantizers.insert(name.to_string(), quantizer);
        }

        Self {
            module,
            dotted_name: dotted_name.to_string(),
            input_quantizers,
            output_quantizers,
            param_quantizers,
        }
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn dotted_name(&self) -> &str {
        &self.dotted_name
    }

    /// Fake-quantized forward pass.
    pub fn forward(
        &mut self,
        registry: &mut ModuleRegistry,
        inputs: &[Tensor],
    ) -> Result<Vec<Tensor>> {
        self.compute_param_encodings(registry, false)?;

        let mut quantized_inputs = Vec::with_capacity(inputs.len());
        for (index, input) in inputs.iter().enumerate() {
            match self.input_quantizers.get_mut(index).and_then(|q| q.as_mut()) {
                Some(quantizer) => quantized_inputs.push(quantizer.forward(input)?),
                None => quantized_inputs.push(input.clone()),
            }
        }

        let substitutes = self.quantized_parameters(registry)?;
        let outputs = {
            let mut guard = ParamGuard::new(registry, self.module);
            for (name, value) in substitutes {
                guard.swap(name, value)?;
            }
            let result = guard.forward(&quantized_inputs);
            drop(guard); // parameters restored on every exit path
            result?
        };

        let mut quantized_outputs = Vec::with_capacity(outputs.len());
        for (index, output) in outputs.iter().enumerate() {
            match self.output_quantizers.get_mut(index).and_then(|q| q.as_mut()) {
                Some(quantizer) => quantized_outputs.push(quantizer.forward(output)?),
                None => quantized_outputs.push(output.clone()),
            }
        }
        Ok(quantized_outputs)
    }

    /// Calibrate parameter quantizers from the current parameter values.
    /// Existing encodings are kept unless `overwrite` is set.
    pub(crate) fn compute_param_encodings(
        &mut self,
        registry: &ModuleRegistry,
        overwrite: bool,
    ) -> Result<()> {
        let layer = self.layer(registry)?;
        for (name, quantizer) in &mut self.param_quantizers {
            if quantizer.is_initialized() && !overwrite {
                continue;
            }
            let Some(param) = layer.parameter(name) else { continue };
            let mut scope = quantizer.begin_calibration();
            scope.forward(param)?;
            scope.finish()?;
        }
        Ok(())
    }

    /// Quantize-dequantized values for every quantized parameter.
    fn quantized_parameters(
        &mut self,
        registry: &ModuleRegistry,
    ) -> Result<Vec<(String, Tensor)>> {
        let layer = registry.leaf(self.module).ok_or_else(|| {
            Error::Structural(format!("module '{}' is not a leaf", self.dotted_name))
        })?;
        let mut quantized = Vec::new();
        for (name, quantizer) in &mut self.param_quantizers {
            let Some(param) = layer.parameter(name) else { continue };
            quantized.push((name.clone(), quantizer.forward(param)?));
        }
        Ok(quantized)
    }

    fn layer<'r>(&self, registry: &'r ModuleRegistry) -> Result<&'r Layer> {
        registry.leaf(self.module).ok_or_else(|| {
            Error::Structural(format!("module '{}' is not a leaf", self.dotted_name))
        })
    }

    /// Switch activation quantizers to observing mode.
    pub(crate) fn begin_observing(&mut self) {
        for quantizer in self.activation_quantizers_mut() {
            quantizer.begin_observing();
        }
    }

    /// Leave observing mode, committing accumulated statistics when
    /// `commit` is set. Partial statistics are always cleared.
    pub(crate) fn end_observing(&mut self, commit: bool) -> Result<()> {
        let mut first_error = None;
        for quantizer in self.activation_quantizers_mut() {
            if let Err(e) = quantizer.end_observing(commit) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn activation_quantizers_mut(&mut self) -> impl Iterator<Item = &mut MinMaxQuantizer> {
        self.input_quantizers
            .iter_mut()
            .chain(self.output_quantizers.iter_mut())
            .flatten()
    }

    /// Activation quantizers with their names, for encoding export.
    pub fn activation_quantizers(&self) -> impl Iterator<Item = &MinMaxQuantizer> {
        self.input_quantizers
            .iter()
            .chain(self.output_quantizers.iter())
            .flatten()
    }
}

/// Scoped parameter substitution. Dropping the guard restores every
/// swapped parameter, including on error and panic paths.
struct ParamGuard<'a> {
    registry: &'a mut ModuleRegistry,
    module: ModuleId,
    originals: Vec<(String, Tensor)>,
}

impl<'a> ParamGuard<'a> {
    fn new(registry: &'a mut ModuleRegistry, module: ModuleId) -> Self {
        Self {
            registry,
            module,
            originals: Vec::new(),
        }
    }

    fn swap(&mut self, name: String, value: Tensor) -> Result<()> {
        let layer = self
            .registry
            .leaf_mut(self.module)
            .ok_or_else(|| Error::Structural(format!("module {} is not a leaf", self.module)))?;
        let original = layer.swap_parameter(&name, value).ok_or_else(|| {
            Error::Structural(format!("layer has no parameter '{name}' to substitute"))
        })?;
        self.originals.push((name, original));
        Ok(())
    }

    fn forward(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        self.registry
            .leaf(self.module)
            .ok_or_else(|| Error::Structural(format!("module {} is not a leaf", self.module)))?
            .forward(inputs)
    }
}

impl Drop for ParamGuard<'_> {
    fn drop(&mut self) {
        if let Some(layer) = self.registry.leaf_mut(self.module) {
            for (name, original) in self.originals.drain(..).rev() {
                let _ = layer.swap_parameter(&name, original);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Linear;
    use approx::assert_abs_diff_eq;
    use ndarray::IxDyn;

    fn linear_fixture() -> (ModuleRegistry, ModuleId, QuantWrapper) {
        let mut registry = ModuleRegistry::new("Net");
        let mut linear = Linear::new(2, 2);
        linear.weight[[0, 0]] = 1.0;
        linear.weight[[1, 1]] = -1.0;
        let id = registry.add_leaf(registry.root(), "fc", Layer::Linear(linear));

        let wrapper_registry = WrapperRegistry::standard();
        let spec = wrapper_registry.spec("addmm").unwrap().clone();
        let wrapper = QuantWrapper::new(
            id,
            "Net.fc",
            registry.leaf(id).unwrap(),
            &spec,
            &QuantSimConfig::default(),
        );
        (registry, id, wrapper)
    }

    fn tensor2(data: Vec<f32>) -> Tensor {
        let cols = data.len();
        Tensor::from_shape_vec(IxDyn(&[1, cols]), data).unwrap()
    }

    #[test]
    fn test_forward_computes_param_encodings_lazily() {
        let (mut registry, _, mut wrapper) = linear_fixture();
        assert!(!wrapper.param_quantizers["weight"].is_initialized());

        // Output quantizer must be calibrated for the call to succeed
        wrapper
            .output_quantizers[0]
            .as_mut()
            .unwrap()
            .set_range(&[-4.0], &[4.0])
            .unwrap();
        wrapper.forward(&mut registry, &[tensor2(vec![1.0, 2.0])]).unwrap();

        assert!(wrapper.param_quantizers["weight"].is_initialized());
    }

    #[test]
    fn test_forward_restores_parameters() {
        let (mut registry, id, mut wrapper) = linear_fixture();
        wrapper
            .output_quantizers[0]
            .as_mut()
            .unwrap()
            .set_range(&[-4.0], &[4.0])
            .unwrap();

        let before = registry.leaf(id).unwrap().parameter("weight").unwrap().clone();
        wrapper.forward(&mut registry, &[tensor2(vec![1.0, 2.0])]).unwrap();
        let after = registry.leaf(id).unwrap().parameter("weight").unwrap();

        assert_eq!(&before, after, "weight must be restored bit for bit");
    }

    #[test]
    fn test_forward_restores_parameters_on_error() {
        let (mut registry, id, mut wrapper) = linear_fixture();
        // Output quantizer left uncalibrated: the call fails after the
        // wrapped layer ran with substituted parameters
        let before = registry.leaf(id).unwrap().parameter("weight").unwrap().clone();
        let err = wrapper.forward(&mut registry, &[tensor2(vec![1.0, 2.0])]);
        assert!(matches!(err, Err(Error::UninitializedQuantizer(_))));

        let after = registry.leaf(id).unwrap().parameter("weight").unwrap();
        assert_eq!(&before, after);
    }

    #[test]
    fn test_forward_output_close_to_float_result() {
        let (mut registry, _, mut wrapper) = linear_fixture();
        wrapper
            .output_quantizers[0]
            .as_mut()
            .unwrap()
            .set_range(&[-4.0], &[4.0])
            .unwrap();

        let outputs = wrapper
            .forward(&mut registry, &[tensor2(vec![1.0, 2.0])])
            .unwrap();
        // Float result is [1.0, -2.0]; 8-bit quantization stays close
        assert_abs_diff_eq!(outputs[0][[0, 0]], 1.0, epsilon = 0.05);
        assert_abs_diff_eq!(outputs[0][[0, 1]], -2.0, epsilon = 0.05);
    }

    #[test]
    fn test_disabled_input_quantizer_passes_through() {
        let (_, _, wrapper) = linear_fixture();
        assert!(wrapper.input_quantizers[0].is_none());
        assert!(wrapper.output_quantizers[0].is_some());
    }

    #[test]
    fn test_observing_scope_commits_activation_ranges() {
        let (mut registry, _, mut wrapper) = linear_fixture();
        wrapper.begin_observing();
        wrapper.forward(&mut registry, &[tensor2(vec![1.0, 2.0])]).unwrap();
        wrapper.end_observing(true).unwrap();

        let output_q = wrapper.output_quantizers[0].as_ref().unwrap();
        assert!(output_q.is_initialized());
    }
}
