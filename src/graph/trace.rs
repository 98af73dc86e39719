//! Traced model representation
//!
//! The host framework's tracing runtime is an external collaborator; the
//! toolkit consumes its output as an instruction-level trace: a
//! [`TraceGraph`] holding a flat list of [`TracedInstruction`]s, with
//! nested sub-traces for non-leaf submodules.
//!
//! The trace can also be executed concretely against a
//! [`ModuleRegistry`]. One concrete pass with the example input stands in
//! for the hooked forward pass of the host framework and captures every
//! module's input/output tensor shapes; the same interpreter, with a
//! custom module dispatch, drives calibration through wrapped modules.

use std::collections::{BTreeMap, HashMap};

use ndarray::{Axis, IxDyn};

use crate::error::{Error, Result};
use crate::nn::{ModuleId, ModuleRegistry, Tensor};

/// Instruction kinds that are skipped entirely (constants, list
/// construction, cast-only instructions), with their inputs forwarded
/// transparently to consumers.
pub(crate) const IGNORED_KINDS: &[&str] =
    &["Constant", "ListConstruct", "Int", "t", "to", "detach"];

/// One instruction of a traced forward pass.
#[derive(Clone, Debug)]
pub enum TracedInstruction {
    /// Bind `output` to the submodule `parent.attr`
    GetAttribute {
        output: String,
        parent: String,
        attr: String,
    },
    /// Invoke the forward method of the module bound to `receiver`
    CallModule {
        output: String,
        receiver: String,
        inputs: Vec<String>,
    },
    /// Apply a functional op (not a module call), e.g. `add`, `cat`
    Functional {
        outputs: Vec<String>,
        kind: String,
        inputs: Vec<String>,
    },
    /// Unpack a tuple-valued result into individually addressable
    /// tensors. The only way a multi-output op's results become
    /// addressable in the traced IR.
    TupleUnpack { outputs: Vec<String>, input: String },
    /// Constant/list-construct/cast-only instruction; transparent to
    /// consumers
    Ignored {
        output: String,
        kind: String,
        inputs: Vec<String>,
    },
}

/// The trace of one (sub)module's forward pass.
///
/// `inputs[0]` names the module's self reference; the remaining inputs
/// are tensor arguments. Sub-traces of non-leaf submodules are keyed by
/// the submodule's dotted name.
#[derive(Clone, Debug, Default)]
pub struct TraceGraph {
    pub inputs: Vec<String>,
    pub instructions: Vec<TracedInstruction>,
    pub subgraphs: BTreeMap<String, TraceGraph>,
    /// Statically known output shapes for functional values, when the
    /// trace carries type information. Usually empty.
    pub shape_hints: BTreeMap<String, Vec<usize>>,
    /// Name of the value the (sub)graph returns. Defaults to the first
    /// output of the last instruction.
    pub output: Option<String>,
}

impl TraceGraph {
    pub fn new(self_name: &str, tensor_inputs: &[&str]) -> Self {
        let mut inputs = vec![self_name.to_string()];
        inputs.extend(tensor_inputs.iter().map(|s| s.to_string()));
        Self {
            inputs,
            ..Default::default()
        }
    }

    pub fn get_attr(&mut self, output: &str, parent: &str, attr: &str) -> &mut Self {
        self.instructions.push(TracedInstruction::GetAttribute {
            output: output.to_string(),
            parent: parent.to_string(),
            attr: attr.to_string(),
        });
        self
    }

    pub fn call_module(&mut self, output: &str, receiver: &str, inputs: &[&str]) -> &mut Self {
        self.instructions.push(TracedInstruction::CallModule {
            output: output.to_string(),
            receiver: receiver.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    pub fn functional(&mut self, output: &str, kind: &str, inputs: &[&str]) -> &mut Self {
        self.instructions.push(TracedInstruction::Functional {
            outputs: vec![output.to_string()],
            kind: kind.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    pub fn tuple_unpack(&mut self, outputs: &[&str], input: &str) -> &mut Self {
        self.instructions.push(TracedInstruction::TupleUnpack {
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            input: input.to_string(),
        });
        self
    }

    pub fn ignored(&mut self, output: &str, kind: &str, inputs: &[&str]) -> &mut Self {
        self.instructions.push(TracedInstruction::Ignored {
            output: output.to_string(),
            kind: kind.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    /// Name of the value this graph returns.
    pub(crate) fn output_value(&self) -> Option<&str> {
        if let Some(output) = &self.output {
            return Some(output);
        }
        self.instructions.iter().rev().find_map(|instr| match instr {
            TracedInstruction::GetAttribute { .. } => None,
            TracedInstruction::CallModule { output, .. } => Some(output.as_str()),
            TracedInstruction::Functional { outputs, .. } => outputs.first().map(|s| s.as_str()),
            TracedInstruction::TupleUnpack { outputs, .. } => outputs.first().map(|s| s.as_str()),
            TracedInstruction::Ignored { output, .. } => Some(output.as_str()),
        })
    }
}

/// A value flowing through trace execution.
#[derive(Clone, Debug)]
pub enum Value {
    Tensor(Tensor),
    Tuple(Vec<Tensor>),
    Module(ModuleId),
}

impl Value {
    fn tensors(&self) -> Option<Vec<Tensor>> {
        match self {
            Value::Tensor(t) => Some(vec![t.clone()]),
            Value::Tuple(ts) => Some(ts.clone()),
            Value::Module(_) => None,
        }
    }

    fn shapes(&self) -> Vec<Vec<usize>> {
        match self {
            Value::Tensor(t) => vec![t.shape().to_vec()],
            Value::Tuple(ts) => ts.iter().map(|t| t.shape().to_vec()).collect(),
            Value::Module(_) => vec![],
        }
    }
}

/// Input and output tensor shapes of one module call.
#[derive(Clone, Debug, Default)]
pub struct ShapeRecord {
    pub inputs: Vec<Vec<usize>>,
    pub outputs: Vec<Vec<usize>>,
}

/// Module → (input shapes, output shapes) captured during one concrete
/// forward pass.
pub type ShapeMap = HashMap<ModuleId, ShapeRecord>;

/// Execute a trace concretely with the registry's own layers.
pub fn execute(
    trace: &TraceGraph,
    registry: &mut ModuleRegistry,
    inputs: &[Tensor],
) -> Result<(Vec<Tensor>, ShapeMap)> {
    execute_with(trace, registry, inputs, &mut |registry, id, xs| {
        let layer = registry
            .leaf(id)
            .ok_or_else(|| Error::Structural(format!("module {id} is not a leaf")))?;
        layer.forward(xs)
    })
}

/// Execute a trace, dispatching leaf module calls through
/// `module_forward`. Used by the simulation orchestrator to route calls
/// through quantization wrappers.
pub fn execute_with<F>(
    trace: &TraceGraph,
    registry: &mut ModuleRegistry,
    inputs: &[Tensor],
    module_forward: &mut F,
) -> Result<(Vec<Tensor>, ShapeMap)>
where
    F: FnMut(&mut ModuleRegistry, ModuleId, &[Tensor]) -> Result<Vec<Tensor>>,
{
    let mut shapes = ShapeMap::new();
    let input_values: Vec<Value> = inputs.iter().cloned().map(Value::Tensor).collect();
    let root = registry.root();
    let result = run_frame(trace, registry, root, &input_values, &mut shapes, module_forward)?;
    let tensors = result
        .tensors()
        .ok_or_else(|| Error::Structural("trace returned a module reference".to_string()))?;
    Ok((tensors, shapes))
}

fn run_frame<F>(
    trace: &TraceGraph,
    registry: &mut ModuleRegistry,
    self_module: ModuleId,
    inputs: &[Value],
    shapes: &mut ShapeMap,
    module_forward: &mut F,
) -> Result<Value>
where
    F: FnMut(&mut ModuleRegistry, ModuleId, &[Tensor]) -> Result<Vec<Tensor>>,
{
    if trace.inputs.len() != inputs.len() + 1 {
        return Err(Error::Structural(format!(
            "trace for '{}' expects {} inputs, got {}",
            registry.name(self_module),
            trace.inputs.len().saturating_sub(1),
            inputs.len()
        )));
    }

    let mut env: HashMap<String, Value> = HashMap::new();
    env.insert(trace.inputs[0].clone(), Value::Module(self_module));
    let mut input_shapes = Vec::new();
    for (name, value) in trace.inputs[1..].iter().zip(inputs) {
        input_shapes.extend(value.shapes());
        env.insert(name.clone(), value.clone());
    }

    for instr in &trace.instructions {
        match instr {
            TracedInstruction::GetAttribute { output, parent, attr } => {
                let parent_id = module_of(&env, parent)?;
                let child = registry.child(parent_id, attr).ok_or_else(|| {
                    Error::Structural(format!(
                        "unresolved module reference '{}.{}'",
                        registry.name(parent_id),
                        attr
                    ))
                })?;
                env.insert(output.clone(), Value::Module(child));
            }
            TracedInstruction::CallModule { output, receiver, inputs } => {
                let receiver_id = module_of(&env, receiver)?;
                let args: Vec<Value> = inputs
                    .iter()
                    .map(|name| value_of(&env, name))
                    .collect::<Result<_>>()?;
                let result = if registry.is_leaf(receiver_id) {
                    let tensors: Vec<Tensor> = args
                        .iter()
                        .flat_map(|v| v.tensors().unwrap_or_default())
                        .collect();
                    let outputs = module_forward(registry, receiver_id, &tensors)?;
                    shapes.insert(
                        receiver_id,
                        ShapeRecord {
                            inputs: tensors.iter().map(|t| t.shape().to_vec()).collect(),
                            outputs: outputs.iter().map(|t| t.shape().to_vec()).collect(),
                        },
                    );
                    if outputs.len() == 1 {
                        Value::Tensor(outputs.into_iter().next().unwrap())
                    } else {
                        Value::Tuple(outputs)
                    }
                } else {
                    let name = registry.name(receiver_id).to_string();
                    let subgraph = trace.subgraphs.get(&name).ok_or_else(|| {
                        Error::Structural(format!("missing sub-trace for module '{name}'"))
                    })?;
                    run_frame(subgraph, registry, receiver_id, &args, shapes, module_forward)?
                };
                env.insert(output.clone(), result);
            }
            TracedInstruction::Functional { outputs, kind, inputs } => {
                if IGNORED_KINDS.contains(&kind.as_str()) {
                    if let (Some(output), Some(value)) =
                        (outputs.first(), inputs.iter().find_map(|n| env.get(n).cloned()))
                    {
                        env.insert(output.clone(), value);
                    }
                    continue;
                }
                if outputs.len() != 1 {
                    return Err(Error::Structural(format!(
                        "multiple output ops are not supported: '{kind}'"
                    )));
                }
                let args: Vec<Tensor> = inputs
                    .iter()
                    .map(|name| value_of(&env, name))
                    .collect::<Result<Vec<_>>>()?
                    .iter()
                    .flat_map(|v| v.tensors().unwrap_or_default())
                    .collect();
                let result = eval_functional(kind, &args)?;
                env.insert(outputs[0].clone(), result);
            }
            TracedInstruction::TupleUnpack { outputs, input } => {
                let value = value_of(&env, input)?;
                let Value::Tuple(tensors) = value else {
                    return Err(Error::Structural(format!(
                        "tuple unpack of non-tuple value '{input}'"
                    )));
                };
                if tensors.len() != outputs.len() {
                    return Err(Error::Structural(format!(
                        "tuple unpack arity mismatch for '{input}': {} vs {}",
                        tensors.len(),
                        outputs.len()
                    )));
                }
                for (name, tensor) in outputs.iter().zip(tensors) {
                    env.insert(name.clone(), Value::Tensor(tensor));
                }
            }
            TracedInstruction::Ignored { output, inputs, .. } => {
                // Cast-like instructions alias their single tensor input;
                // constants and list constructions bind nothing
                if let Some(value) = inputs.iter().find_map(|name| env.get(name).cloned()) {
                    env.insert(output.clone(), value);
                }
            }
        }
    }

    let output_name = trace
        .output_value()
        .ok_or_else(|| Error::Structural("trace has no output value".to_string()))?;
    let result = value_of(&env, output_name)?;
    shapes.insert(
        self_module,
        ShapeRecord {
            inputs: input_shapes,
            outputs: result.shapes(),
        },
    );
    Ok(result)
}

fn module_of(env: &HashMap<String, Value>, name: &str) -> Result<ModuleId> {
    match env.get(name) {
        Some(Value::Module(id)) => Ok(*id),
        _ => Err(Error::Structural(format!(
            "'{name}' does not reference a module"
        ))),
    }
}

fn value_of(env: &HashMap<String, Value>, name: &str) -> Result<Value> {
    env.get(name)
        .cloned()
        .ok_or_else(|| Error::Structural(format!("unresolved value '{name}'")))
}

fn eval_functional(kind: &str, args: &[Tensor]) -> Result<Value> {
    match kind {
        "add" | "sub" => {
            let [a, b] = args else {
                return Err(Error::Structural(format!("{kind} expects two inputs")));
            };
            if a.shape() != b.shape() {
                return Err(Error::ShapeMismatch {
                    expected: a.shape().to_vec(),
                    got: b.shape().to_vec(),
                });
            }
            Ok(Value::Tensor(if kind == "add" { a + b } else { a - b }))
        }
        "cat" => {
            let views: Vec<_> = args.iter().map(|t| t.view()).collect();
            let out = ndarray::concatenate(Axis(1), &views)
                .map_err(|e| Error::Structural(format!("cat failed: {e}")))?;
            Ok(Value::Tensor(out))
        }
        "view" | "reshape" | "flatten" => {
            let [x] = args else {
                return Err(Error::Structural(format!("{kind} expects one input")));
            };
            let n = x.shape().first().copied().unwrap_or(1);
            let rest: usize = x.shape()[1..].iter().product();
            let flat = x
                .clone()
                .into_shape_with_order(IxDyn(&[n, rest]))
                .map_err(|e| Error::Structural(format!("{kind} failed: {e}")))?;
            Ok(Value::Tensor(flat))
        }
        "TupleConstruct" => Ok(Value::Tuple(args.to_vec())),
        _ => Err(Error::Structural(format!(
            "unsupported functional op '{kind}'"
        ))),
    }
}
