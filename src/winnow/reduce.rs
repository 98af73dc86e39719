//! Module reduction
//!
//! Physically rebuilds a layer's parameter tensors from the kept-channel
//! indices of a winnow plan and updates the declared channel counts to
//! match. When a winnow reaches a producer-less boundary (a model
//! input), the `reshape` flag decides between inserting an explicit
//! channel-select adapter layer and failing.

use ndarray::Axis;

use crate::error::{Error, Result};
use crate::graph::ConnectedGraph;
use crate::nn::{BatchNorm2d, Conv2d, Layer, Linear, ModuleRegistry};
use crate::winnow::mask::{one_positions, Mask};
use crate::winnow::propagate::WinnowPlan;

/// Reduces modules according to a winnow plan.
pub struct ModuleReducer {
    reshape: bool,
}

impl ModuleReducer {
    /// `reshape` selects the boundary policy: `true` inserts
    /// channel-select adapter layers, `false` fails when a winnow cannot
    /// be absorbed upstream.
    pub fn new(reshape: bool) -> Self {
        Self { reshape }
    }

    /// Apply the plan, mutating the registry's layers in place. Returns
    /// the names of the ops whose modules were reduced.
    pub fn reduce_modules(
        &self,
        registry: &mut ModuleRegistry,
        graph: &ConnectedGraph,
        plan: &WinnowPlan,
    ) -> Result<Vec<String>> {
        if !plan.boundaries.is_empty() {
            if !self.reshape {
                let products: Vec<&str> =
                    plan.boundaries.iter().map(|(name, _)| name.as_str()).collect();
                return Err(Error::MaskPropagation(format!(
                    "winnowed channels reach producer-less products {products:?}; \
                     enable reshape to insert adapter layers"
                )));
            }
            for (index, (_, mask)) in plan.boundaries.iter().enumerate() {
                let indices = one_positions(mask);
                registry.add_leaf(
                    registry.root(),
                    &format!("downsample_{index}"),
                    Layer::ChannelSelect { indices },
                );
            }
        }

        let mut reduced = Vec::new();
        for (op_name, masks) in &plan.op_masks {
            let Some(op) = graph.get_op(op_name) else { continue };
            let Some(module) = op.module else { continue };
            let Some(layer) = registry.leaf_mut(module) else { continue };

            let input_mask = masks.input_masks.iter().flatten().next();
            let output_mask = masks.output_mask.as_ref();

            let changed = match layer {
                Layer::Conv2d(conv) => reduce_conv(conv, input_mask, output_mask)?,
                Layer::Linear(linear) => reduce_linear(linear, input_mask, output_mask)?,
                Layer::BatchNorm2d(bn) => reduce_batch_norm(bn, input_mask.or(output_mask))?,
                Layer::ReLU | Layer::MaxPool2d(_) | Layer::ChannelSelect { .. } => false,
            };
            if changed {
                reduced.push(op_name.clone());
            }
        }
        Ok(reduced)
    }
}

fn check_len(mask: &Mask, expected: usize, what: &str) -> Result<()> {
    if mask.len() != expected {
        return Err(Error::MaskPropagation(format!(
            "mask of {} entries cannot reduce {what} of width {expected}",
            mask.len()
        )));
    }
    Ok(())
}

fn reduce_conv(
    conv: &mut Conv2d,
    input_mask: Option<&Mask>,
    output_mask: Option<&Mask>,
) -> Result<bool> {
    let mut changed = false;
    if let Some(mask) = output_mask {
        check_len(mask, conv.out_channels, "conv output channels")?;
        let keep = one_positions(mask);
        conv.weight = conv.weight.select(Axis(0), &keep);
        if let Some(bias) = &conv.bias {
            conv.bias = Some(bias.select(Axis(0), &keep));
        }
        conv.out_channels = keep.len();
        changed = true;
    }
    if let Some(mask) = input_mask {
        check_len(mask, conv.in_channels, "conv input channels")?;
        let keep = one_positions(mask);
        if conv.groups == 1 {
            conv.weight = conv.weight.select(Axis(1), &keep);
            conv.in_channels = keep.len();
        } else if conv.groups == conv.in_channels {
            // Depthwise: per-channel kernels, input and group counts move
            // together
            conv.in_channels = keep.len();
            conv.groups = keep.len();
        } else {
            return Err(Error::MaskPropagation(format!(
                "winnowing grouped convolutions is only supported for depthwise \
                 layers, got groups={}",
                conv.groups
            )));
        }
        changed = true;
    }
    Ok(changed)
}

fn reduce_linear(
    linear: &mut Linear,
    input_mask: Option<&Mask>,
    output_mask: Option<&Mask>,
) -> Result<bool> {
    let mut changed = false;
    if let Some(mask) = output_mask {
        check_len(mask, linear.out_features, "linear output features")?;
        let keep = one_positions(mask);
        linear.weight = linear.weight.select(Axis(0), &keep);
        if let Some(bias) = &linear.bias {
            linear.bias = Some(bias.select(Axis(0), &keep));
        }
        linear.out_features = keep.len();
        changed = true;
    }
    if let Some(mask) = input_mask {
        check_len(mask, linear.in_features, "linear input features")?;
        let keep = one_positions(mask);
        linear.weight = linear.weight.select(Axis(1), &keep);
        linear.in_features = keep.len();
        changed = true;
    }
    Ok(changed)
}

fn reduce_batch_norm(bn: &mut BatchNorm2d, mask: Option<&Mask>) -> Result<bool> {
    let Some(mask) = mask else { return Ok(false) };
    check_len(mask, bn.num_features, "batch norm features")?;
    let keep = one_positions(mask);
    bn.weight = bn.weight.select(Axis(0), &keep);
    bn.bias = bn.bias.select(Axis(0), &keep);
    bn.running_mean = bn.running_mean.select(Axis(0), &keep);
    bn.running_var = bn.running_var.select(Axis(0), &keep);
    bn.num_features = keep.len();
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{execute, GraphBuilder, TraceGraph};
    use crate::nn::Tensor;
    use ndarray::IxDyn;
    use std::collections::BTreeMap;

    fn input(shape: &[usize]) -> Tensor {
        Tensor::from_elem(IxDyn(shape), 1.0)
    }

    fn mask(bits: &[u8]) -> Mask {
        bits.iter().map(|b| *b == 1).collect()
    }

    fn chain_model() -> (ModuleRegistry, TraceGraph) {
        let mut registry = ModuleRegistry::new("Net");
        let root = registry.root();
        registry.add_leaf(root, "conv1", Layer::Conv2d(Conv2d::new(3, 8, (1, 1))));
        registry.add_leaf(root, "bn1", Layer::BatchNorm2d(BatchNorm2d::new(8)));
        registry.add_leaf(root, "conv2", Layer::Conv2d(Conv2d::new(8, 4, (1, 1))));

        let mut trace = TraceGraph::new("self", &["x"]);
        trace
            .get_attr("m1", "self", "conv1")
            .call_module("v1", "m1", &["x"])
            .get_attr("m2", "self", "bn1")
            .call_module("v2", "m2", &["v1"])
            .get_attr("m3", "self", "conv2")
            .call_module("v3", "m3", &["v2"]);
        (registry, trace)
    }

    #[test]
    fn test_chain_reduction_rewrites_weights_and_attrs() {
        let (mut registry, trace) = chain_model();
        let graph = GraphBuilder::build(&mut registry, &trace, &[input(&[1, 3, 4, 4])]).unwrap();
        let conv2 = graph.get_op_by_dotted_name("Net.conv2").unwrap().name.clone();

        let m = mask(&[1, 0, 1, 0, 1, 0, 1, 0]);
        let plan = crate::winnow::propagate_masks(&graph, &BTreeMap::from([(conv2, m)])).unwrap();
        let reduced = ModuleReducer::new(false)
            .reduce_modules(&mut registry, &graph, &plan)
            .unwrap();
        assert_eq!(reduced.len(), 3);

        let conv1 = registry.id_by_name("Net.conv1").unwrap();
        match registry.leaf(conv1).unwrap() {
            Layer::Conv2d(conv) => {
                assert_eq!(conv.out_channels, 4);
                assert_eq!(conv.weight.shape(), &[4, 3, 1, 1]);
                assert_eq!(conv.bias.as_ref().unwrap().shape(), &[4]);
            }
            _ => unreachable!(),
        }
        let bn = registry.id_by_name("Net.bn1").unwrap();
        match registry.leaf(bn).unwrap() {
            Layer::BatchNorm2d(bn) => {
                assert_eq!(bn.num_features, 4);
                assert_eq!(bn.running_var.shape(), &[4]);
            }
            _ => unreachable!(),
        }
        let conv2 = registry.id_by_name("Net.conv2").unwrap();
        match registry.leaf(conv2).unwrap() {
            Layer::Conv2d(conv) => {
                assert_eq!(conv.in_channels, 4);
                assert_eq!(conv.out_channels, 4);
                assert_eq!(conv.weight.shape(), &[4, 4, 1, 1]);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_reduced_model_still_executes() {
        let (mut registry, trace) = chain_model();
        let graph = GraphBuilder::build(&mut registry, &trace, &[input(&[1, 3, 4, 4])]).unwrap();
        let conv2 = graph.get_op_by_dotted_name("Net.conv2").unwrap().name.clone();

        let plan = crate::winnow::propagate_masks(
            &graph,
            &BTreeMap::from([(conv2, mask(&[1, 1, 1, 0, 0, 0, 0, 1]))]),
        )
        .unwrap();
        ModuleReducer::new(false)
            .reduce_modules(&mut registry, &graph, &plan)
            .unwrap();

        let (outputs, _) = execute(&trace, &mut registry, &[input(&[1, 3, 4, 4])]).unwrap();
        assert_eq!(outputs[0].shape(), &[1, 4, 4, 4]);
    }

    #[test]
    fn test_boundary_without_reshape_fails() {
        let (mut registry, trace) = chain_model();
        let graph = GraphBuilder::build(&mut registry, &trace, &[input(&[1, 3, 4, 4])]).unwrap();
        let conv1 = graph.get_op_by_dotted_name("Net.conv1").unwrap().name.clone();

        let plan =
            crate::winnow::propagate_masks(&graph, &BTreeMap::from([(conv1, mask(&[1, 0, 1]))]))
                .unwrap();
        let err = ModuleReducer::new(false).reduce_modules(&mut registry, &graph, &plan);
        assert!(matches!(err, Err(Error::MaskPropagation(_))));
    }

    #[test]
    fn test_boundary_with_reshape_inserts_adapter() {
        let (mut registry, trace) = chain_model();
        let graph = GraphBuilder::build(&mut registry, &trace, &[input(&[1, 3, 4, 4])]).unwrap();
        let conv1 = graph.get_op_by_dotted_name("Net.conv1").unwrap().name.clone();

        let plan =
            crate::winnow::propagate_masks(&graph, &BTreeMap::from([(conv1, mask(&[1, 0, 1]))]))
                .unwrap();
        ModuleReducer::new(true)
            .reduce_modules(&mut registry, &graph, &plan)
            .unwrap();

        let adapter = registry.id_by_name("Net.downsample_0").unwrap();
        match registry.leaf(adapter).unwrap() {
            Layer::ChannelSelect { indices } => assert_eq!(indices, &vec![0, 2]),
            _ => unreachable!(),
        }
        // conv1's input side was reduced to the kept channels
        let conv1 = registry.id_by_name("Net.conv1").unwrap();
        match registry.leaf(conv1).unwrap() {
            Layer::Conv2d(conv) => assert_eq!(conv.in_channels, 2),
            _ => unreachable!(),
        }
    }
}
