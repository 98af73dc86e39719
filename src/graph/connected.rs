//! Connected graph container
//!
//! Owns the complete op and product collections, keyed by unique name.
//! Producer/consumer links are stored as names into the owning maps, so
//! the graph has no reference cycles and needs no explicit teardown.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::error::{Error, Result};
use crate::graph::op::Op;
use crate::graph::product::Product;
use crate::nn::ModuleId;

/// The reconstructed dataflow graph of one traced model execution.
///
/// Built once per (model, example input) pair and mutated only during
/// construction; downstream consumers (winnowing, quantsim) treat it as
/// immutable.
#[derive(Debug)]
pub struct ConnectedGraph {
    model_name: String,
    ops: BTreeMap<String, Op>,
    products: BTreeMap<String, Product>,
    /// Op names in the order they were emitted while walking the trace.
    /// Synthesized Split ops are not part of the traversal order.
    pub ordered_ops: Vec<String>,
    module_to_op: HashMap<ModuleId, String>,
}

impl ConnectedGraph {
    pub(crate) fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            ops: BTreeMap::new(),
            products: BTreeMap::new(),
            ordered_ops: Vec::new(),
            module_to_op: HashMap::new(),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn get_all_ops(&self) -> &BTreeMap<String, Op> {
        &self.ops
    }

    pub fn get_all_products(&self) -> &BTreeMap<String, Product> {
        &self.products
    }

    pub fn get_op(&self, name: &str) -> Option<&Op> {
        self.ops.get(name)
    }

    pub fn get_product(&self, name: &str) -> Option<&Product> {
        self.products.get(name)
    }

    /// The op owned by the given module, if any.
    pub fn get_op_from_module(&self, module: ModuleId) -> Option<&Op> {
        self.module_to_op.get(&module).and_then(|name| self.ops.get(name))
    }

    /// Look up an op by the dotted path of its owning module.
    pub fn get_op_by_dotted_name(&self, dotted_name: &str) -> Option<&Op> {
        self.ops.values().find(|op| op.dotted_name == dotted_name)
    }

    /// Names of all products whose producer has the given dotted name.
    ///
    /// An op stores only its most recent output product, so a fanned-out
    /// producer must be searched for through the product collection.
    pub fn product_names_from_dotted_name(&self, dotted_name: &str) -> Vec<String> {
        self.products
            .values()
            .filter(|product| {
                product
                    .producer
                    .as_ref()
                    .and_then(|name| self.ops.get(name))
                    .is_some_and(|op| op.dotted_name == dotted_name)
            })
            .map(|product| product.name.clone())
            .collect()
    }

    /// Input slot of `consumer` fed by `preceding_op`, scanning the
    /// consumer's ordered inputs for the preceding op's identity. First
    /// match wins.
    pub fn input_index_of_preceding_op(&self, preceding_op: &str, consumer: &Op) -> Option<usize> {
        consumer.inputs.iter().position(|product_name| {
            self.products
                .get(product_name)
                .and_then(|product| product.producer.as_deref())
                == Some(preceding_op)
        })
    }

    /// Ops in a topological order that respects producer/consumer edges,
    /// starting from ops fed only by model inputs and parameters.
    pub fn topological_order(&self) -> Vec<String> {
        let mut pending: BTreeMap<String, usize> = self
            .ops
            .iter()
            .map(|(name, op)| {
                let in_degree = op
                    .inputs
                    .iter()
                    .filter(|p| {
                        self.products
                            .get(p.as_str())
                            .is_some_and(|product| product.producer.is_some())
                    })
                    .count();
                (name.clone(), in_degree)
            })
            .collect();

        let mut queue: VecDeque<String> = pending
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(name, _)| name.clone())
            .collect();
        let mut order = Vec::with_capacity(self.ops.len());

        while let Some(name) = queue.pop_front() {
            // A fanned-out producer keeps several output products alive,
            // so every produced product's consumers are walked
            let consumers: Vec<String> = self
                .products
                .values()
                .filter(|p| p.producer.as_deref() == Some(name.as_str()))
                .flat_map(|p| p.consumers.clone())
                .collect();
            order.push(name);
            for consumer in consumers {
                if let Some(degree) = pending.get_mut(&consumer) {
                    if *degree > 0 {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(consumer);
                        }
                    }
                }
            }
        }
        order
    }

    // Construction-time mutation helpers

    pub(crate) fn insert_op(&mut self, op: Op, in_traversal_order: bool) -> Result<()> {
        if self.ops.contains_key(&op.name) {
            return Err(Error::Structural(format!("duplicate op binding for '{}'", op.name)));
        }
        if let Some(module) = op.module {
            self.module_to_op.insert(module, op.name.clone());
        }
        if in_traversal_order {
            self.ordered_ops.push(op.name.clone());
        }
        self.ops.insert(op.name.clone(), op);
        Ok(())
    }

    pub(crate) fn insert_product(&mut self, product: Product) -> Result<()> {
        if self.products.contains_key(&product.name) {
            return Err(Error::Structural(format!(
                "duplicate product binding for '{}'",
                product.name
            )));
        }
        self.products.insert(product.name.clone(), product);
        Ok(())
    }

    pub(crate) fn op_mut(&mut self, name: &str) -> Option<&mut Op> {
        self.ops.get_mut(name)
    }

    pub(crate) fn assign_module(&mut self, op_name: &str, module: ModuleId, dotted_name: &str) {
        if let Some(op) = self.ops.get_mut(op_name) {
            op.module = Some(module);
            op.dotted_name = dotted_name.to_string();
        }
        self.module_to_op.insert(module, op_name.to_string());
    }

    pub(crate) fn product_mut(&mut self, name: &str) -> Option<&mut Product> {
        self.products.get_mut(name)
    }

    pub(crate) fn remove_op(&mut self, name: &str) {
        if let Some(op) = self.ops.remove(name) {
            if let Some(module) = op.module {
                self.module_to_op.remove(&module);
            }
        }
        self.ordered_ops.retain(|n| n != name);
    }

    pub(crate) fn remove_product(&mut self, name: &str) {
        self.products.remove(name);
    }
}
