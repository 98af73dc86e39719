//! Connected graph builder
//!
//! Walks a [`TraceGraph`] depth-first, emitting ops and products in
//! execution order, then normalizes the result:
//! 1. Tuple pack/unpack scaffolding is removed, rewiring producers
//!    directly to the eventual consumers
//! 2. Parameter products (weight/bias/running stats) are attached to
//!    ops whose module exposes them
//! 3. A Split op is synthesized wherever one op's output fans out to
//!    several distinct consumers
//! 4. Missing output shapes are backfilled in topological order
//! 5. Every op without an owning module must carry a known
//!    pure-functional op type
//!
//! The traversal uses an explicit frame stack rather than recursion, so
//! its depth is not tied to model nesting depth.

use std::collections::HashMap;

use log::{error, warn};

use crate::error::{Error, Result};
use crate::graph::connected::ConnectedGraph;
use crate::graph::op::Op;
use crate::graph::product::Product;
use crate::graph::trace::{self, ShapeMap, TraceGraph, TracedInstruction, IGNORED_KINDS};
use crate::nn::{ModuleId, ModuleRegistry, Tensor};

/// Op types allowed to exist without an owning module.
const FUNCTIONAL_OPS: &[&str] = &[
    "cat",
    "size",
    "NumToTensor",
    "view",
    "add",
    "sub",
    "mul",
    "div",
    "narrow",
    "reshape",
    "flatten",
    "mean",
    "index_select",
    "slice",
    "select",
    "unsqueeze",
    "Split",
];

/// Channel dimension of activation tensors.
const CHANNEL_AXIS: usize = 1;

#[derive(Clone, Debug)]
enum GraphValue {
    Op(String),
    Product(String),
    Module(ModuleId),
}

struct Frame<'t> {
    trace: &'t TraceGraph,
    pc: usize,
    env: HashMap<String, GraphValue>,
    /// (parent frame index, value name) to bind with the sub-graph's
    /// final op once this frame completes
    bind_on_return: Option<(usize, String)>,
}

/// Builds a [`ConnectedGraph`] from a traced model execution and one
/// example input.
pub struct GraphBuilder<'a> {
    registry: &'a ModuleRegistry,
    graph: ConnectedGraph,
    shapes: ShapeMap,
    op_count: usize,
    split_count: usize,
}

impl<'a> GraphBuilder<'a> {
    /// Trace the model once concretely (capturing per-module tensor
    /// shapes), walk the symbolic trace, and normalize the graph.
    pub fn build(
        registry: &'a mut ModuleRegistry,
        trace: &TraceGraph,
        example_input: &[Tensor],
    ) -> Result<ConnectedGraph> {
        let (_, shapes) = trace::execute(trace, registry, example_input)?;
        let graph = ConnectedGraph::new(registry.model_name());
        let mut builder = GraphBuilder {
            registry,
            graph,
            shapes,
            op_count: 0,
            split_count: 0,
        };
        builder.parse(trace, example_input)?;
        builder.remove_tuple_ops()?;
        builder.fill_op_params()?;
        builder.insert_split_ops()?;
        builder.fill_empty_shapes()?;
        builder.validate_op_modules()?;
        Ok(builder.graph)
    }

    // -- trace traversal ----------------------------------------------------

    fn parse(&mut self, trace: &TraceGraph, example_input: &[Tensor]) -> Result<()> {
        let mut root_env = HashMap::new();
        root_env.insert(trace.inputs[0].clone(), GraphValue::Module(self.registry.root()));
        for (name, tensor) in trace.inputs[1..].iter().zip(example_input) {
            let mut product = Product::new(name.clone(), Some(tensor.shape().to_vec()));
            product.is_model_input = true;
            self.graph.insert_product(product)?;
            root_env.insert(name.clone(), GraphValue::Product(name.clone()));
        }

        let mut frames = vec![Frame {
            trace,
            pc: 0,
            env: root_env,
            bind_on_return: None,
        }];

        while let Some(top) = frames.len().checked_sub(1) {
            if frames[top].pc >= frames[top].trace.instructions.len() {
                let frame = frames.pop().expect("frame stack underflow");
                if let Some((parent, name)) = frame.bind_on_return {
                    let last_op = self.graph.ordered_ops.last().cloned().ok_or_else(|| {
                        Error::Structural("sub-graph produced no operations".to_string())
                    })?;
                    frames[parent].env.insert(name, GraphValue::Op(last_op));
                }
                continue;
            }

            let instr = frames[top].trace.instructions[frames[top].pc].clone();
            frames[top].pc += 1;

            match instr {
                TracedInstruction::GetAttribute { output, parent, attr } => {
                    let parent_id = match frames[top].env.get(&parent) {
                        Some(GraphValue::Module(id)) => *id,
                        _ => {
                            return Err(Error::Structural(format!(
                                "'{parent}' does not reference a module"
                            )))
                        }
                    };
                    let child = self.registry.child(parent_id, &attr).ok_or_else(|| {
                        Error::Structural(format!(
                            "unresolved module reference '{}.{}'",
                            self.registry.name(parent_id),
                            attr
                        ))
                    })?;
                    if frames[top].env.contains_key(&output) {
                        return Err(Error::Structural(format!(
                            "duplicate module binding for '{output}'"
                        )));
                    }
                    frames[top].env.insert(output, GraphValue::Module(child));
                }

                TracedInstruction::CallModule { output, receiver, inputs } => {
                    let receiver_id = match frames[top].env.get(&receiver) {
                        Some(GraphValue::Module(id)) => *id,
                        _ => {
                            return Err(Error::Structural(format!(
                                "'{receiver}' does not reference a module"
                            )))
                        }
                    };
                    let resolved = resolve_all(&frames[top], &inputs)?;
                    if self.registry.is_leaf(receiver_id) {
                        let op_name = self.create_leaf_module_op(receiver_id, resolved)?;
                        frames[top].env.insert(output, GraphValue::Op(op_name));
                    } else {
                        let dotted = self.registry.name(receiver_id).to_string();
                        let subgraph =
                            frames[top].trace.subgraphs.get(&dotted).ok_or_else(|| {
                                Error::Structural(format!(
                                    "missing sub-trace for module '{dotted}'"
                                ))
                            })?;
                        if subgraph.inputs.len() != resolved.len() + 1 {
                            return Err(Error::Structural(format!(
                                "sub-trace for '{dotted}' expects {} inputs, got {}",
                                subgraph.inputs.len().saturating_sub(1),
                                resolved.len()
                            )));
                        }
                        let mut env = HashMap::new();
                        env.insert(
                            subgraph.inputs[0].clone(),
                            GraphValue::Module(receiver_id),
                        );
                        for (name, value) in subgraph.inputs[1..].iter().zip(resolved) {
                            env.insert(name.clone(), value);
                        }
                        frames.push(Frame {
                            trace: subgraph,
                            pc: 0,
                            env,
                            bind_on_return: Some((top, output)),
                        });
                    }
                }

                TracedInstruction::Functional { outputs, kind, inputs } => {
                    if IGNORED_KINDS.contains(&kind.as_str()) {
                        continue;
                    }
                    if outputs.len() != 1 {
                        error!("multiple output ops are not supported: '{kind}'");
                        return Err(Error::Structural(format!(
                            "multiple output ops are not supported: '{kind}'"
                        )));
                    }
                    let resolved = resolve_all(&frames[top], &inputs)?;
                    let hint = frames[top].trace.shape_hints.get(&outputs[0]).cloned();
                    let op_name = self.create_functional_op(&kind, resolved, hint)?;
                    frames[top].env.insert(outputs[0].clone(), GraphValue::Op(op_name));
                }

                TracedInstruction::TupleUnpack { outputs, input } => {
                    self.create_tuple_ops(&mut frames[top], &outputs, &input)?;
                }

                TracedInstruction::Ignored { .. } => {}
            }
        }
        Ok(())
    }

    /// One synthetic op per unpacked element, each bound to the
    /// corresponding captured output tensor shape of the producing
    /// module.
    fn create_tuple_ops(
        &mut self,
        frame: &mut Frame<'_>,
        outputs: &[String],
        input: &str,
    ) -> Result<()> {
        let producing_module = frame
            .trace
            .instructions
            .iter()
            .find_map(|instr| match instr {
                TracedInstruction::CallModule { output, receiver, .. } if output == input => {
                    match frame.env.get(receiver) {
                        Some(GraphValue::Module(id)) => Some(*id),
                        _ => None,
                    }
                }
                _ => None,
            })
            .ok_or_else(|| {
                Error::Structural(format!("tuple unpack of '{input}' has no producing module"))
            })?;
        let output_shapes = self
            .shapes
            .get(&producing_module)
            .map(|record| record.outputs.clone())
            .unwrap_or_default();

        let input_names = [input.to_string()];
        for (i, output) in outputs.iter().enumerate() {
            let resolved = resolve_all(frame, &input_names)?;
            let input_shape = resolved.first().and_then(|v| self.shape_of(v));
            let op_name = self.create_op_and_products("TupleUnpack", resolved)?;
            let output_shape = output_shapes.get(i).cloned().ok_or_else(|| {
                Error::Structural(format!(
                    "no captured output tensor {i} for tuple unpack of '{input}'"
                ))
            })?;
            self.fill_and_check_shapes(&op_name, input_shape.as_deref(), &output_shape);
            frame
                .env
                .insert(output.clone(), GraphValue::Op(op_name));
        }
        Ok(())
    }

    fn shape_of(&self, value: &GraphValue) -> Option<Vec<usize>> {
        match value {
            GraphValue::Op(name) => self.graph.get_op(name)?.output_shape.clone(),
            GraphValue::Product(name) => self.graph.get_product(name)?.shape.clone(),
            GraphValue::Module(_) => None,
        }
    }

    // -- op creation --------------------------------------------------------

    fn create_leaf_module_op(
        &mut self,
        module: ModuleId,
        inputs: Vec<GraphValue>,
    ) -> Result<String> {
        let layer = self.registry.leaf(module).ok_or_else(|| {
            Error::Structural(format!("module {module} is not a leaf"))
        })?;
        let op_type = layer.kind().to_string();
        let groups = layer.groups();
        let op_name = self.create_op_and_products(&op_type, inputs)?;

        let dotted = self.registry.name(module).to_string();
        self.graph.assign_module(&op_name, module, &dotted);
        if let Some(op) = self.graph.op_mut(&op_name) {
            op.groups = groups;
        }

        let record = self.shapes.get(&module).cloned().ok_or_else(|| {
            Error::Structural(format!(
                "module '{dotted}' was never executed in the traced forward pass"
            ))
        })?;
        // First tensor defines the shape; multiple inputs are assumed alike
        let input_shape = record.inputs.first().cloned();
        let output_shape = record.outputs.first().cloned().ok_or_else(|| {
            Error::Structural(format!("module '{dotted}' produced no output tensor"))
        })?;
        self.fill_and_check_shapes(&op_name, input_shape.as_deref(), &output_shape);
        Ok(op_name)
    }

    fn create_functional_op(
        &mut self,
        kind: &str,
        inputs: Vec<GraphValue>,
        shape_hint: Option<Vec<usize>>,
    ) -> Result<String> {
        let input_shape = inputs.first().and_then(|v| self.shape_of(v));
        let op_name = self.create_op_and_products(kind, inputs)?;
        // Without static type information the shapes stay unset until the
        // backfill pass
        if let Some(output_shape) = shape_hint {
            self.fill_and_check_shapes(&op_name, input_shape.as_deref(), &output_shape);
        }
        Ok(op_name)
    }

    fn create_op_and_products(
        &mut self,
        op_type: &str,
        inputs: Vec<GraphValue>,
    ) -> Result<String> {
        let name = format!("{op_type}_{}", self.op_count);
        self.op_count += 1;
        let op = Op::new(&name, &name, op_type);
        self.graph.insert_op(op, true)?;

        for value in inputs {
            match value {
                GraphValue::Op(parent) => self.link_inter_op_product(&parent, &name)?,
                GraphValue::Product(product_name) => {
                    if let Some(product) = self.graph.product_mut(&product_name) {
                        product.add_consumer(&name);
                    }
                    if let Some(op) = self.graph.op_mut(&name) {
                        op.add_input(&product_name);
                    }
                }
                GraphValue::Module(_) => {
                    return Err(Error::Structural(format!(
                        "module reference used as tensor input of '{name}'"
                    )))
                }
            }
        }
        Ok(name)
    }

    /// Create (or reuse) the product linking `parent` to `current`.
    fn link_inter_op_product(&mut self, parent: &str, current: &str) -> Result<()> {
        let product_name = format!("{parent}_to_{current}");
        if self.graph.get_product(&product_name).is_none() {
            let shape = self
                .graph
                .get_op(parent)
                .and_then(|op| op.output_shape.clone());
            self.graph.insert_product(Product::new(&product_name, shape))?;
        }
        if let Some(op) = self.graph.op_mut(parent) {
            op.output = Some(product_name.clone());
        }
        if let Some(product) = self.graph.product_mut(&product_name) {
            product.producer = Some(parent.to_string());
            product.add_consumer(current);
        }
        if let Some(op) = self.graph.op_mut(current) {
            op.add_input(&product_name);
        }
        Ok(())
    }

    /// Fill op and product shapes from one observed forward pass,
    /// reporting (but not correcting) disagreements with previously
    /// recorded shapes. Batch-dimension mismatches are tolerated.
    fn fill_and_check_shapes(
        &mut self,
        op_name: &str,
        input_shape: Option<&[usize]>,
        output_shape: &[usize],
    ) {
        let (op_inputs, op_output) = {
            let op = self.graph.op_mut(op_name).expect("op exists");
            op.output_shape = Some(output_shape.to_vec());
            op.input_shape = input_shape.map(|s| s.to_vec());
            (op.inputs.clone(), op.output.clone())
        };

        if let Some(input_shape) = input_shape {
            for product_name in op_inputs {
                let Some(product) = self.graph.product_mut(&product_name) else {
                    continue;
                };
                if product.is_parameter {
                    continue;
                }
                match &product.shape {
                    Some(shape) if shape[1..] != input_shape[1..] => {
                        warn!(
                            "mismatch between recorded shape {:?} for product '{}' and \
                             observed input shape {:?} of op '{}'",
                            shape, product_name, input_shape, op_name
                        );
                    }
                    Some(_) => {}
                    None => product.shape = Some(input_shape.to_vec()),
                }
            }
        }

        if let Some(output_name) = op_output {
            if let Some(product) = self.graph.product_mut(&output_name) {
                match &product.shape {
                    Some(shape) if shape[1..] != output_shape[1..] => {
                        error!(
                            "mismatch between recorded shape {:?} for product '{}' and \
                             observed output shape {:?} of op '{}'",
                            shape, output_name, output_shape, op_name
                        );
                    }
                    Some(_) => {}
                    None => product.shape = Some(output_shape.to_vec()),
                }
            }
        }
    }

    // -- normalization passes -----------------------------------------------

    /// Remove TupleConstruct/TupleUnpack scaffolding, rewiring each pack
    /// producer directly to the eventual unpack consumers.
    fn remove_tuple_ops(&mut self) -> Result<()> {
        let mut remove_ops: Vec<String> = Vec::new();
        let mut remove_products: Vec<String> = Vec::new();

        for op_name in self.graph.ordered_ops.clone() {
            let Some(op) = self.graph.get_op(&op_name) else { continue };
            if op.op_type != "TupleConstruct" {
                continue;
            }
            remove_ops.push(op_name.clone());
            let pack_producers = op.inputs.clone();

            // Consumer products ordered by the trailing index of the
            // TupleUnpack op they feed, i.e. tuple element order
            let mut pack_consumers: Vec<String> = self
                .graph
                .get_all_products()
                .values()
                .filter(|p| p.producer.as_deref() == Some(op_name.as_str()))
                .map(|p| p.name.clone())
                .collect();
            pack_consumers.sort_by_key(|name| trailing_number(name));

            // No consumer: the tuple is the final model output
            if pack_consumers.is_empty() {
                for producer_product in &pack_producers {
                    if let Some(producer) = self
                        .graph
                        .get_product(producer_product)
                        .and_then(|p| p.producer.clone())
                    {
                        if let Some(producer_op) = self.graph.op_mut(&producer) {
                            producer_op.output = None;
                        }
                    }
                }
                remove_products.extend(pack_producers);
                continue;
            }

            if pack_consumers.len() != pack_producers.len() {
                return Err(Error::Structural(format!(
                    "tuple pack/unpack arity mismatch at '{op_name}': {} vs {}",
                    pack_producers.len(),
                    pack_consumers.len()
                )));
            }

            for (pack_producer, pack_consumer) in pack_producers.iter().zip(&pack_consumers) {
                let unpack_consumers = self
                    .graph
                    .get_product(pack_consumer)
                    .map(|p| p.consumers.clone())
                    .unwrap_or_default();
                let [unpack_op] = unpack_consumers.as_slice() else {
                    return Err(Error::Structural(format!(
                        "tuple product '{pack_consumer}' must have exactly one consumer"
                    )));
                };
                let unpack_op = unpack_op.clone();
                if self.graph.get_op(&unpack_op).map(|o| o.op_type.as_str()) != Some("TupleUnpack")
                {
                    return Err(Error::Structural(format!(
                        "consumer of tuple product '{pack_consumer}' is not a tuple unpack"
                    )));
                }

                remove_products.push(pack_producer.clone());
                remove_products.push(pack_consumer.clone());
                remove_ops.push(unpack_op.clone());

                let producer_op = self
                    .graph
                    .get_product(pack_producer)
                    .and_then(|p| p.producer.clone())
                    .ok_or_else(|| {
                        Error::Structural(format!(
                            "tuple element product '{pack_producer}' has no producer"
                        ))
                    })?;

                let unpack_products: Vec<String> = self
                    .graph
                    .get_all_products()
                    .values()
                    .filter(|p| p.producer.as_deref() == Some(unpack_op.as_str()))
                    .map(|p| p.name.clone())
                    .collect();

                // Unpacked element never consumed downstream: null the
                // producer's output binding rather than leaving it dangling
                if unpack_products.is_empty() {
                    if let Some(op) = self.graph.op_mut(&producer_op) {
                        op.output = None;
                    }
                    continue;
                }

                remove_products.extend(unpack_products.iter().cloned());
                for unpack_product in unpack_products {
                    let consumers = self
                        .graph
                        .get_product(&unpack_product)
                        .map(|p| p.consumers.clone())
                        .unwrap_or_default();
                    for consumer in consumers {
                        let new_name = format!("{producer_op}_to_{consumer}");
                        let shape = self
                            .graph
                            .get_op(&producer_op)
                            .and_then(|op| op.output_shape.clone());
                        let mut product = Product::new(&new_name, shape);
                        product.producer = Some(producer_op.clone());
                        product.add_consumer(&consumer);
                        self.graph.remove_product(&new_name);
                        self.graph.insert_product(product)?;
                        if let Some(op) = self.graph.op_mut(&producer_op) {
                            op.output = Some(new_name.clone());
                        }

                        // Replace the consumer's unpack-fed slots
                        let slots: Vec<usize> = {
                            let consumer_op = self.graph.get_op(&consumer).expect("consumer");
                            consumer_op
                                .inputs
                                .iter()
                                .enumerate()
                                .filter(|(_, p)| {
                                    self.graph
                                        .get_product(p)
                                        .and_then(|prod| prod.producer.as_deref())
                                        == Some(unpack_op.as_str())
                                })
                                .map(|(i, _)| i)
                                .collect()
                        };
                        if let Some(consumer_op) = self.graph.op_mut(&consumer) {
                            for slot in slots {
                                consumer_op.inputs[slot] = new_name.clone();
                            }
                        }
                    }
                }
            }
        }

        for product in remove_products {
            self.graph.remove_product(&product);
        }
        for op in remove_ops {
            self.graph.remove_op(&op);
        }
        Ok(())
    }

    /// Attach weight/bias (and batch-norm running statistics) products to
    /// ops whose module exposes them, if not already present.
    fn fill_op_params(&mut self) -> Result<()> {
        for op_name in self.graph.ordered_ops.clone() {
            let Some(op) = self.graph.get_op(&op_name) else { continue };
            if !matches!(op.op_type.as_str(), "convolution" | "batch_norm" | "addmm" | "matmul") {
                continue;
            }
            let Some(module) = op.module else { continue };
            let dotted = op.dotted_name.clone();
            let Some(layer) = self.registry.leaf(module) else { continue };

            let params: Vec<(String, Vec<usize>)> = layer
                .parameters()
                .into_iter()
                .map(|(name, tensor)| (format!("{dotted}.{name}"), tensor.shape().to_vec()))
                .collect();
            for (product_name, shape) in params {
                if self.graph.get_product(&product_name).is_some() {
                    continue;
                }
                let mut product = Product::new(&product_name, Some(shape));
                product.is_parameter = true;
                product.add_consumer(&op_name);
                self.graph.insert_product(product)?;
                if let Some(op) = self.graph.op_mut(&op_name) {
                    op.add_input(&product_name);
                }
            }
        }
        Ok(())
    }

    /// Synthesize a Split op below every op whose output feeds more than
    /// one distinct consumer.
    fn insert_split_ops(&mut self) -> Result<()> {
        let op_names: Vec<String> = self.graph.get_all_ops().keys().cloned().collect();
        for op_name in op_names {
            let Some(op) = self.graph.get_op(&op_name) else { continue };
            let dotted = op.dotted_name.clone();
            let output_products = self.graph.product_names_from_dotted_name(&dotted);
            // The same module may be invoked more than once; only products
            // actually emitted by this op count towards its fan-out
            let matching: Vec<String> = output_products
                .into_iter()
                .filter(|name| name.contains(op_name.as_str()))
                .collect();
            if matching.len() > 1 {
                self.insert_split_op(&op_name, matching)?;
            }
        }
        Ok(())
    }

    fn insert_split_op(&mut self, preceding: &str, out_products: Vec<String>) -> Result<()> {
        let (output_shape, preceding_output) = {
            let op = self.graph.get_op(preceding).expect("op exists");
            (op.output_shape.clone(), op.output.clone())
        };
        let product_shape = preceding_output
            .as_ref()
            .and_then(|name| self.graph.get_product(name))
            .and_then(|product| product.shape.clone());

        let split_name = format!("Split_{}", self.split_count);
        self.split_count += 1;
        let mut split = Op::new(
            &split_name,
            format!("{}.{}", self.graph.model_name(), split_name),
            "Split",
        );
        split.is_anonymous = true;
        split.output_shape = output_shape;
        // Synthesized, not part of the traversal order
        self.graph.insert_op(split, false)?;

        // Split's single output product collects all fan-out consumers
        let split_product = format!("{split_name}__to__multiple_ops");
        let mut product = Product::new(&split_product, product_shape.clone());
        product.producer = Some(split_name.clone());
        self.graph.insert_product(product)?;
        if let Some(op) = self.graph.op_mut(&split_name) {
            op.output = Some(split_product.clone());
        }

        for old_product in &out_products {
            let Some(consumer) = self
                .graph
                .get_product(old_product)
                .and_then(|p| p.consumers.first().cloned())
            else {
                continue;
            };
            if let Some(p) = self.graph.product_mut(&split_product) {
                p.add_consumer(&consumer);
            }
            let consumer_op = self.graph.get_op(&consumer).expect("consumer exists");
            // Multi-input consumers need their original slot recomputed
            // from the preceding op's identity; first match wins
            let slot = if matches!(consumer_op.op_type.as_str(), "cat" | "add") {
                self.graph
                    .input_index_of_preceding_op(preceding, consumer_op)
                    .unwrap_or(0)
            } else {
                0
            };
            if let Some(op) = self.graph.op_mut(&consumer) {
                op.inputs[slot] = split_product.clone();
            }
        }

        for old_product in &out_products {
            self.graph.remove_product(old_product);
        }

        let new_name = format!("{preceding}__to__{split_name}");
        let mut product = Product::new(&new_name, product_shape);
        product.producer = Some(preceding.to_string());
        product.add_consumer(&split_name);
        self.graph.insert_product(product)?;
        if let Some(op) = self.graph.op_mut(preceding) {
            op.output = Some(new_name.clone());
        }
        if let Some(op) = self.graph.op_mut(&split_name) {
            op.inputs = vec![new_name];
        }
        Ok(())
    }

    /// Backfill missing output shapes in topological order. Concat sums
    /// the channel dimensions of its inputs; any other anonymous op is
    /// assumed shape-preserving, which is an approximation for true
    /// shape-changing ops.
    fn fill_empty_shapes(&mut self) -> Result<()> {
        for op_name in self.graph.topological_order() {
            let op = self.graph.get_op(&op_name).expect("op exists");
            for input in &op.inputs {
                let shape_known = self
                    .graph
                    .get_product(input)
                    .is_some_and(|p| p.shape.is_some());
                if !shape_known {
                    return Err(Error::Structural(format!(
                        "input product '{input}' of op '{op_name}' has no shape"
                    )));
                }
            }
            if op.output_shape.is_some() {
                continue;
            }

            let product_shape = op
                .output
                .as_ref()
                .and_then(|name| self.graph.get_product(name))
                .and_then(|product| product.shape.clone());
            let input_shape = |graph: &ConnectedGraph, name: &str| {
                graph.get_product(name).and_then(|p| p.shape.clone())
            };

            let output_shape = if let Some(shape) = product_shape {
                shape
            } else if op.op_type == "cat" {
                let mut channels = 0;
                for input in &op.inputs {
                    channels += input_shape(&self.graph, input)
                        .map(|s| s[CHANNEL_AXIS])
                        .unwrap_or(0);
                }
                let mut shape = input_shape(&self.graph, &op.inputs[0]).expect("checked above");
                shape[CHANNEL_AXIS] = channels;
                shape
            } else {
                input_shape(&self.graph, &op.inputs[0]).expect("checked above")
            };

            let output_product = op.output.clone();
            if let Some(op) = self.graph.op_mut(&op_name) {
                op.output_shape = Some(output_shape.clone());
            }
            if let Some(name) = output_product {
                if let Some(product) = self.graph.product_mut(&name) {
                    if product.shape.is_none() {
                        product.shape = Some(output_shape);
                    }
                }
            }
        }
        Ok(())
    }

    /// Every op lacking an owning module must carry a known
    /// pure-functional op type; anything else silently breaks winnowing
    /// correctness, so it is a hard failure.
    fn validate_op_modules(&self) -> Result<()> {
        let missing: Vec<&str> = self
            .graph
            .get_all_ops()
            .values()
            .filter(|op| op.module.is_none() && !FUNCTIONAL_OPS.contains(&op.op_type.as_str()))
            .map(|op| op.name.as_str())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(Error::Structural(format!(
            "Ops with missing modules: {missing:?}. This can be due to several reasons: \
             1. There is no mapping for the op type to a known module kind. \
             2. The op is defined as a functional in the forward pass instead of as a module. \
             3. The op cannot be defined as a module but has not been added to the \
             pure-functional allow-list."
        )))
    }
}

/// Resolve value names to graph entities, looking through ignored
/// instructions by forwarding their inputs transparently.
fn resolve_all(frame: &Frame<'_>, names: &[String]) -> Result<Vec<GraphValue>> {
    let mut resolved = Vec::with_capacity(names.len());
    for name in names {
        resolve_into(frame, name, &mut resolved)?;
    }
    Ok(resolved)
}

fn resolve_into(frame: &Frame<'_>, name: &str, out: &mut Vec<GraphValue>) -> Result<()> {
    if let Some(value) = frame.env.get(name) {
        out.push(value.clone());
        return Ok(());
    }
    for instr in &frame.trace.instructions {
        let forwarded_inputs = match instr {
            TracedInstruction::Ignored { output, inputs, .. } if output == name => Some(inputs),
            TracedInstruction::Functional { outputs, kind, inputs }
                if IGNORED_KINDS.contains(&kind.as_str())
                    && outputs.iter().any(|o| o == name) =>
            {
                Some(inputs)
            }
            _ => None,
        };
        if let Some(inputs) = forwarded_inputs {
            for input in inputs {
                resolve_into(frame, input, out)?;
            }
            return Ok(());
        }
    }
    Err(Error::Structural(format!("unresolved value '{name}'")))
}

/// Last run of ASCII digits in a name, used to order tuple consumer
/// products by the index of the TupleUnpack op they feed.
fn trailing_number(name: &str) -> usize {
    let digits: String = name
        .chars()
        .rev()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.chars().rev().collect::<String>().parse().unwrap_or(0)
}
