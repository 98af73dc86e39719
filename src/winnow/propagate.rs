//! Mask propagation over a connected graph
//!
//! Given winnow requests (a kept-channel mask on the input of selected
//! channel-defining ops), computes the consistent input/output masks
//! every affected op needs so that parameter tensors can be reduced
//! without breaking shape agreement at any product boundary.
//!
//! Propagation walks upstream from each request until a channel-defining
//! (Null) op absorbs the mask, and downstream wherever a Split or Add
//! forces siblings to agree. Skip ops are transparent; unrecognized op
//! types block propagation with an error.

use std::collections::{BTreeMap, VecDeque};

use crate::error::{Error, Result};
use crate::graph::{ConnectedGraph, Op};
use crate::winnow::connectivity::{ConnectivityType, OpConnectivity};
use crate::winnow::mask::Mask;

/// Channel dimension of activation tensors.
const CHANNEL_AXIS: usize = 1;

/// Input/output masks computed for one op. Input masks are slot-aligned
/// with the op's input products; parameter slots stay `None`.
#[derive(Clone, Debug, Default)]
pub struct OpMasks {
    pub input_masks: Vec<Option<Mask>>,
    pub output_mask: Option<Mask>,
}

/// The result of mask propagation.
#[derive(Debug, Default)]
pub struct WinnowPlan {
    /// Masks per affected op name
    pub op_masks: BTreeMap<String, OpMasks>,
    /// Products whose producer-less source (model input/constant) cannot
    /// absorb the winnow; resolved by the reducer's reshape policy
    pub boundaries: Vec<(String, Mask)>,
}

impl WinnowPlan {
    pub fn masks_for(&self, op_name: &str) -> Option<&OpMasks> {
        self.op_masks.get(op_name)
    }
}

enum Task {
    /// The producer side of `product` must emit only the kept channels
    Up { product: String, mask: Mask },
    /// The mask arrives at `consumer` through `product`
    Down {
        product: String,
        consumer: String,
        mask: Mask,
    },
}

/// Compute consistent per-op masks for the given winnow requests.
///
/// Each request maps an op name (which must classify as
/// [`ConnectivityType::Null`], i.e. convolution or linear) to a
/// kept-channel mask over that op's input channels.
pub fn propagate_masks(
    graph: &ConnectedGraph,
    to_winnow: &BTreeMap<String, Mask>,
) -> Result<WinnowPlan> {
    let mut plan = WinnowPlan::default();
    let mut queue: VecDeque<Task> = VecDeque::new();

    for (op_name, mask) in to_winnow {
        let op = graph
            .get_op(op_name)
            .ok_or_else(|| Error::MaskPropagation(format!("unknown op '{op_name}'")))?;
        if connectivity(op)? != ConnectivityType::Null {
            return Err(Error::MaskPropagation(format!(
                "winnow requests must target channel-defining ops, '{op_name}' is '{}'",
                op.op_type
            )));
        }
        let input = first_data_input(graph, op).ok_or_else(|| {
            Error::MaskPropagation(format!("op '{op_name}' has no data input"))
        })?;
        let channels = product_channels(graph, &input)?;
        if mask.len() != channels {
            return Err(Error::MaskPropagation(format!(
                "mask for '{op_name}' has {} entries, input has {channels} channels",
                mask.len()
            )));
        }
        if set_input_mask(&mut plan, graph, op_name, &input, mask)? {
            queue.push_back(Task::Up {
                product: input,
                mask: mask.clone(),
            });
        }
    }

    while let Some(task) = queue.pop_front() {
        match task {
            Task::Up { product, mask } => {
                let prod = graph.get_product(&product).ok_or_else(|| {
                    Error::MaskPropagation(format!("unknown product '{product}'"))
                })?;
                let Some(producer) = prod.producer.clone() else {
                    // Model input or constant: nothing upstream can absorb
                    // the winnow
                    plan.boundaries.push((product, mask));
                    continue;
                };
                let op = graph.get_op(&producer).expect("producer exists");
                match connectivity(op)? {
                    ConnectivityType::Null => {
                        set_output_mask(&mut plan, graph, &producer, &mask)?;
                    }
                    ConnectivityType::Direct => {
                        set_output_mask(&mut plan, graph, &producer, &mask)?;
                        if let Some(input) = first_data_input(graph, op) {
                            if set_input_mask(&mut plan, graph, &producer, &input, &mask)? {
                                queue.push_back(Task::Up { product: input, mask });
                            }
                        }
                    }
                    ConnectivityType::Split => {
                        set_output_mask(&mut plan, graph, &producer, &mask)?;
                        if let Some(input) = first_data_input(graph, op) {
                            if set_input_mask(&mut plan, graph, &producer, &input, &mask)? {
                                queue.push_back(Task::Up {
                                    product: input,
                                    mask: mask.clone(),
                                });
                            }
                        }
                        // Every sibling consumer of the split must agree
                        for (out_product, consumer) in consumers_of(graph, op) {
                            queue.push_back(Task::Down {
                                product: out_product,
                                consumer,
                                mask: mask.clone(),
                            });
                        }
                    }
                    ConnectivityType::Add => {
                        set_output_mask(&mut plan, graph, &producer, &mask)?;
                        for (_, input) in data_input_slots(graph, op) {
                            if set_input_mask(&mut plan, graph, &producer, &input, &mask)? {
                                queue.push_back(Task::Up {
                                    product: input,
                                    mask: mask.clone(),
                                });
                            }
                        }
                    }
                    ConnectivityType::Concat => {
                        set_output_mask(&mut plan, graph, &producer, &mask)?;
                        let mut offset = 0;
                        for (_, input) in data_input_slots(graph, op) {
                            let channels = product_channels(graph, &input)?;
                            if offset + channels > mask.len() {
                                return Err(Error::MaskPropagation(format!(
                                    "concat mask of {} entries is shorter than its inputs",
                                    mask.len()
                                )));
                            }
                            let segment: Mask = mask[offset..offset + channels].to_vec();
                            offset += channels;
                            if set_input_mask(&mut plan, graph, &producer, &input, &segment)? {
                                queue.push_back(Task::Up {
                                    product: input,
                                    mask: segment,
                                });
                            }
                        }
                    }
                    ConnectivityType::Skip => {
                        // Transparent: the requirement falls through to the
                        // op's own input
                        if let Some(input) = first_data_input(graph, op) {
                            queue.push_back(Task::Up { product: input, mask });
                        }
                    }
                }
            }

            Task::Down {
                product,
                consumer,
                mask,
            } => {
                let op = graph.get_op(&consumer).ok_or_else(|| {
                    Error::MaskPropagation(format!("unknown op '{consumer}'"))
                })?;
                match connectivity(op)? {
                    ConnectivityType::Null => {
                        set_input_mask(&mut plan, graph, &consumer, &product, &mask)?;
                    }
                    ConnectivityType::Direct | ConnectivityType::Split => {
                        set_input_mask(&mut plan, graph, &consumer, &product, &mask)?;
                        if set_output_mask(&mut plan, graph, &consumer, &mask)? {
                            for (out_product, next) in consumers_of(graph, op) {
                                queue.push_back(Task::Down {
                                    product: out_product,
                                    consumer: next,
                                    mask: mask.clone(),
                                });
                            }
                        }
                    }
                    ConnectivityType::Add => {
                        set_input_mask(&mut plan, graph, &consumer, &product, &mask)?;
                        // Sibling inputs are forced to the identical mask
                        for (_, input) in data_input_slots(graph, op) {
                            if input != product
                                && set_input_mask(&mut plan, graph, &consumer, &input, &mask)?
                            {
                                queue.push_back(Task::Up {
                                    product: input,
                                    mask: mask.clone(),
                                });
                            }
                        }
                        if set_output_mask(&mut plan, graph, &consumer, &mask)? {
                            for (out_product, next) in consumers_of(graph, op) {
                                queue.push_back(Task::Down {
                                    product: out_product,
                                    consumer: next,
                                    mask: mask.clone(),
                                });
                            }
                        }
                    }
                    ConnectivityType::Concat => {
                        set_input_mask(&mut plan, graph, &consumer, &product, &mask)?;
                        let slots = data_input_slots(graph, op);
                        let masks = &plan.op_masks[&consumer].input_masks;
                        let collected: Option<Vec<&Mask>> = slots
                            .iter()
                            .map(|(slot, _)| masks[*slot].as_ref())
                            .collect();
                        if let Some(parts) = collected {
                            let full: Mask = parts.into_iter().flatten().copied().collect();
                            if set_output_mask(&mut plan, graph, &consumer, &full)? {
                                for (out_product, next) in consumers_of(graph, op) {
                                    queue.push_back(Task::Down {
                                        product: out_product,
                                        consumer: next,
                                        mask: full.clone(),
                                    });
                                }
                            }
                        }
                    }
                    ConnectivityType::Skip => {
                        for (out_product, next) in consumers_of(graph, op) {
                            queue.push_back(Task::Down {
                                product: out_product,
                                consumer: next,
                                mask: mask.clone(),
                            });
                        }
                    }
                }
            }
        }
    }

    Ok(plan)
}

fn connectivity(op: &Op) -> Result<ConnectivityType> {
    OpConnectivity::get(&op.op_type).ok_or_else(|| {
        Error::MaskPropagation(format!(
            "op '{}' of type '{}' has no connectivity classification",
            op.name, op.op_type
        ))
    })
}

fn first_data_input(graph: &ConnectedGraph, op: &Op) -> Option<String> {
    op.inputs
        .iter()
        .find(|name| {
            graph
                .get_product(name)
                .is_some_and(|product| !product.is_parameter)
        })
        .cloned()
}

fn data_input_slots(graph: &ConnectedGraph, op: &Op) -> Vec<(usize, String)> {
    op.inputs
        .iter()
        .enumerate()
        .filter(|(_, name)| {
            graph
                .get_product(name)
                .is_some_and(|product| !product.is_parameter)
        })
        .map(|(slot, name)| (slot, name.clone()))
        .collect()
}

fn consumers_of(graph: &ConnectedGraph, op: &Op) -> Vec<(String, String)> {
    let Some(output) = &op.output else {
        return Vec::new();
    };
    graph
        .get_product(output)
        .map(|product| {
            product
                .consumers
                .iter()
                .map(|consumer| (output.clone(), consumer.clone()))
                .collect()
        })
        .unwrap_or_default()
}

fn product_channels(graph: &ConnectedGraph, product: &str) -> Result<usize> {
    graph
        .get_product(product)
        .and_then(|p| p.shape.as_ref())
        .and_then(|shape| shape.get(CHANNEL_AXIS))
        .copied()
        .ok_or_else(|| {
            Error::MaskPropagation(format!("product '{product}' has no channel dimension"))
        })
}

fn set_input_mask(
    plan: &mut WinnowPlan,
    graph: &ConnectedGraph,
    op_name: &str,
    product: &str,
    mask: &Mask,
) -> Result<bool> {
    let op = graph
        .get_op(op_name)
        .ok_or_else(|| Error::MaskPropagation(format!("unknown op '{op_name}'")))?;
    let slot = op
        .inputs
        .iter()
        .position(|name| name == product)
        .ok_or_else(|| {
            Error::MaskPropagation(format!("'{product}' is not an input of '{op_name}'"))
        })?;
    let entry = plan
        .op_masks
        .entry(op_name.to_string())
        .or_insert_with(|| OpMasks {
            input_masks: vec![None; op.inputs.len()],
            output_mask: None,
        });
    if entry.input_masks.len() < op.inputs.len() {
        entry.input_masks.resize(op.inputs.len(), None);
    }
    match &entry.input_masks[slot] {
        Some(existing) if existing == mask => Ok(false),
        Some(_) => Err(Error::MaskPropagation(format!(
            "conflicting masks arrived at input {slot} of '{op_name}'"
        ))),
        None => {
            entry.input_masks[slot] = Some(mask.clone());
            Ok(true)
        }
    }
}

fn set_output_mask(
    plan: &mut WinnowPlan,
    graph: &ConnectedGraph,
    op_name: &str,
    mask: &Mask,
) -> Result<bool> {
    let op = graph
        .get_op(op_name)
        .ok_or_else(|| Error::MaskPropagation(format!("unknown op '{op_name}'")))?;
    let entry = plan
        .op_masks
        .entry(op_name.to_string())
        .or_insert_with(|| OpMasks {
            input_masks: vec![None; op.inputs.len()],
            output_mask: None,
        });
    match &entry.output_mask {
        Some(existing) if existing == mask => Ok(false),
        Some(_) => Err(Error::MaskPropagation(format!(
            "conflicting masks arrived at the output of '{op_name}'"
        ))),
        None => {
            entry.output_mask = Some(mask.clone());
            Ok(true)
        }
    }
}
