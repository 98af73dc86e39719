//! Quantization simulation orchestration
//!
//! Wraps every leaf module of a traced model with quantizers, drives a
//! representative dataset through the wrapped model to calibrate
//! quantizer ranges, then freezes and exports the encodings in the
//! legacy record format.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::{execute_with, TraceGraph};
use crate::nn::{ModuleId, ModuleRegistry, Tensor};
use crate::quant::EncodingRecord;
use crate::wrap::{QuantWrapper, WrapperRegistry};

pub use crate::wrap::QuantSimConfig;

/// Exported encodings: per-quantizer records keyed by quantizer name,
/// split into activation and parameter sections.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EncodingFile {
    pub activation_encodings: BTreeMap<String, Vec<EncodingRecord>>,
    pub param_encodings: BTreeMap<String, Vec<EncodingRecord>>,
}

/// A quantization-simulated model: the module registry plus one
/// quantization wrapper per leaf module.
pub struct QuantSim {
    registry: ModuleRegistry,
    trace: TraceGraph,
    wrappers: BTreeMap<ModuleId, QuantWrapper>,
}

impl QuantSim {
    /// Wrap every leaf module that has a registered wrapper spec.
    pub fn new(
        registry: ModuleRegistry,
        trace: TraceGraph,
        wrapper_registry: &WrapperRegistry,
        config: &QuantSimConfig,
    ) -> Self {
        let mut wrappers = BTreeMap::new();
        for id in registry.leaf_ids() {
            let layer = registry.leaf(id).expect("leaf id");
            let Some(spec) = wrapper_registry.spec(layer.kind()) else {
                continue;
            };
            let dotted = registry.name(id).to_string();
            wrappers.insert(id, QuantWrapper::new(id, &dotted, layer, spec, config));
        }
        Self {
            registry,
            trace,
            wrappers,
        }
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn wrapper(&self, module: ModuleId) -> Option<&QuantWrapper> {
        self.wrappers.get(&module)
    }

    pub fn wrapper_mut(&mut self, module: ModuleId) -> Option<&mut QuantWrapper> {
        self.wrappers.get_mut(&module)
    }

    /// Quantized forward pass through the traced graph.
    pub fn forward(&mut self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let Self {
            registry,
            trace,
            wrappers,
        } = self;
        Self::run(registry, trace, wrappers, inputs)
    }

    fn run(
        registry: &mut ModuleRegistry,
        trace: &TraceGraph,
        wrappers: &mut BTreeMap<ModuleId, QuantWrapper>,
        inputs: &[Tensor],
    ) -> Result<Vec<Tensor>> {
        let (outputs, _) = execute_with(trace, registry, inputs, &mut |registry, id, xs| {
            match wrappers.get_mut(&id) {
                Some(wrapper) => wrapper.forward(registry, xs),
                None => registry
                    .leaf(id)
                    .ok_or_else(|| Error::Structural(format!("module {id} is not a leaf")))?
                    .forward(xs),
            }
        })?;
        Ok(outputs)
    }

    /// Calibrate all quantizers by driving up to `max_batches` inputs
    /// through the model with every quantizer observing statistics.
    ///
    /// The observing mode is restored and partial statistics are cleared
    /// on every exit path; an exhausted iterator ends the run gracefully
    /// with however many batches were seen. Returns the batch count.
    pub fn compute_encodings<I>(&mut self, batches: I, max_batches: usize) -> Result<usize>
    where
        I: IntoIterator<Item = Vec<Tensor>>,
    {
        let Self {
            registry,
            trace,
            wrappers,
        } = self;

        // Parameter encodings are recomputed from the current values
        for wrapper in wrappers.values_mut() {
            wrapper.compute_param_encodings(registry, true)?;
        }

        for wrapper in wrappers.values_mut() {
            wrapper.begin_observing();
        }

        let mut seen = 0;
        let mut first_error = None;
        for batch in batches.into_iter().take(max_batches) {
            match Self::run(registry, trace, wrappers, &batch) {
                Ok(_) => seen += 1,
                Err(e) => {
                    first_error = Some(e);
                    break;
                }
            }
        }

        // Always leave observing mode, committing only on success
        let commit = first_error.is_none();
        for wrapper in wrappers.values_mut() {
            if let Err(e) = wrapper.end_observing(commit) {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(seen),
        }
    }

    /// Freeze and export all committed encodings in the legacy record
    /// format. Uncalibrated quantizers are omitted.
    pub fn export_encodings(&self) -> EncodingFile {
        let mut file = EncodingFile::default();
        for wrapper in self.wrappers.values() {
            for quantizer in wrapper.activation_quantizers() {
                if let Some(records) = quantizer.legacy_encodings() {
                    file.activation_encodings
                        .insert(quantizer.name().to_string(), records);
                }
            }
            for quantizer in wrapper.param_quantizers.values() {
                if let Some(records) = quantizer.legacy_encodings() {
                    file.param_encodings
                        .insert(quantizer.name().to_string(), records);
                }
            }
        }
        file
    }

    /// Write the exported encodings as JSON.
    pub fn save_encodings(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = self.export_encodings();
        fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{Conv2d, Layer, Linear};
    use ndarray::IxDyn;

    fn input(shape: &[usize], fill: f32) -> Tensor {
        Tensor::from_elem(IxDyn(shape), fill)
    }

    fn simple_sim() -> QuantSim {
        let mut registry = ModuleRegistry::new("Net");
        let root = registry.root();
        let mut conv = Conv2d::new(3, 4, (1, 1));
        conv.weight.fill(0.1);
        registry.add_leaf(root, "conv1", Layer::Conv2d(conv));
        registry.add_leaf(root, "relu1", Layer::ReLU);
        let mut linear = Linear::new(4 * 4 * 4, 2);
        linear.weight.fill(0.01);
        registry.add_leaf(root, "fc", Layer::Linear(linear));

        let mut trace = TraceGraph::new("self", &["x"]);
        trace
            .get_attr("m1", "self", "conv1")
            .call_module("v1", "m1", &["x"])
            .get_attr("m2", "self", "relu1")
            .call_module("v2", "m2", &["v1"])
            .functional("v3", "flatten", &["v2"])
            .get_attr("m3", "self", "fc")
            .call_module("v4", "m3", &["v3"]);

        QuantSim::new(
            registry,
            trace,
            &WrapperRegistry::standard(),
            &QuantSimConfig::default(),
        )
    }

    fn batches(n: usize) -> Vec<Vec<Tensor>> {
        (0..n)
            .map(|i| vec![input(&[1, 3, 4, 4], 0.5 + i as f32 * 0.1)])
            .collect()
    }

    #[test]
    fn test_forward_before_calibration_fails() {
        let mut sim = simple_sim();
        let err = sim.forward(&[input(&[1, 3, 4, 4], 1.0)]).unwrap_err();
        assert!(matches!(err, Error::UninitializedQuantizer(_)));
    }

    #[test]
    fn test_calibration_then_forward() {
        let mut sim = simple_sim();
        let seen = sim.compute_encodings(batches(4), 8).unwrap();
        assert_eq!(seen, 4, "exhausted iterator ends the loop gracefully");

        let outputs = sim.forward(&[input(&[1, 3, 4, 4], 0.7)]).unwrap();
        assert_eq!(outputs[0].shape(), &[1, 2]);
    }

    #[test]
    fn test_calibration_respects_batch_limit() {
        let mut sim = simple_sim();
        let seen = sim.compute_encodings(batches(10), 3).unwrap();
        assert_eq!(seen, 3);
    }

    #[test]
    fn test_failed_calibration_restores_observing_mode() {
        let mut sim = simple_sim();
        // Second batch has the wrong channel count and fails mid-run
        let bad = vec![
            vec![input(&[1, 3, 4, 4], 1.0)],
            vec![input(&[1, 2, 4, 4], 1.0)],
        ];
        assert!(sim.compute_encodings(bad, 8).is_err());

        let conv = sim.registry().id_by_name("Net.conv1").unwrap();
        let wrapper = sim.wrapper(conv).unwrap();
        for quantizer in wrapper.activation_quantizers() {
            assert!(!quantizer.is_observing(), "observing mode must be restored");
            assert!(!quantizer.is_initialized(), "partial statistics are discarded");
        }
    }

    #[test]
    fn test_export_contains_param_and_activation_records() {
        let mut sim = simple_sim();
        sim.compute_encodings(batches(2), 8).unwrap();

        let file = sim.export_encodings();
        assert!(file.param_encodings.contains_key("Net.conv1.weight"));
        assert!(file.activation_encodings.contains_key("Net.conv1.output.0"));

        // Symmetric parameter encodings carry the legacy offset shift
        let weight = &file.param_encodings["Net.conv1.weight"][0];
        assert_eq!(weight.offset, -128);
        assert_eq!(weight.is_symmetric, "True");
        assert_eq!(weight.dtype, "int");

        let output = &file.activation_encodings["Net.conv1.output.0"][0];
        assert_eq!(output.is_symmetric, "False");
        assert_eq!(output.bitwidth, 8);
    }

    #[test]
    fn test_save_encodings_round_trips_through_json() {
        let mut sim = simple_sim();
        sim.compute_encodings(batches(2), 8).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("encodings.json");
        sim.save_encodings(&path).unwrap();

        let loaded: EncodingFile =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(
            loaded.param_encodings.len(),
            sim.export_encodings().param_encodings.len()
        );
        assert_eq!(loaded.param_encodings["Net.fc.weight"][0].is_symmetric, "True");
    }

    #[test]
    fn test_zero_batches_leaves_quantizers_uninitialized() {
        let mut sim = simple_sim();
        let seen = sim.compute_encodings(Vec::new(), 8).unwrap();
        assert_eq!(seen, 0);

        let conv = sim.registry().id_by_name("Net.conv1").unwrap();
        let wrapper = sim.wrapper(conv).unwrap();
        for quantizer in wrapper.activation_quantizers() {
            assert!(!quantizer.is_initialized());
        }
    }
}
