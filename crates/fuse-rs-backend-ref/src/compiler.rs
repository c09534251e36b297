use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fuse_rs::compile::{CompileError, EngineProbe, PartitionCompiler};
use fuse_rs::fusion::Partition;
use fuse_rs::graph::{contiguous_strides, DType, Layout, LogicalTensor, Op, OpKind, TensorId};

use crate::plan::{binding_order, KernelPlan, KernelStep};
use crate::shapes::infer_output_shape;
use crate::BACKEND_NAME;

/// Engine state shared by the compiler and its cache. Every reset starts a
/// new generation, which invalidates plans compiled before it.
#[derive(Debug, Default)]
pub struct RefEngine {
    generation: AtomicU64,
}

impl RefEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new generation and returns it.
    pub fn reset(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(generation, "reference engine reset");
        generation
    }
}

impl EngineProbe for RefEngine {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Lowers partitions into [`KernelPlan`]s with resolved shapes and layouts.
#[derive(Debug, Clone)]
pub struct RefCompiler {
    engine: Arc<RefEngine>,
}

impl RefCompiler {
    pub fn new(engine: Arc<RefEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<RefEngine> {
        &self.engine
    }
}

impl PartitionCompiler for RefCompiler {
    type Artifact = KernelPlan;

    fn backend_name(&self) -> &str {
        BACKEND_NAME
    }

    fn compile(
        &self,
        partition: &Partition,
        inputs: &[LogicalTensor],
        outputs: &[LogicalTensor],
    ) -> Result<KernelPlan, CompileError> {
        if !partition.is_supported() || partition.backend() != Some(BACKEND_NAME) {
            return Err(CompileError::Unsupported {
                partition: partition.id(),
                backend: BACKEND_NAME.to_string(),
            });
        }
        check_arity("input", partition.inputs().len(), inputs.len())?;
        check_arity("output", partition.outputs().len(), outputs.len())?;

        // Caller descriptors bind to boundary tensors by position.
        let mut values: HashMap<TensorId, LogicalTensor> = HashMap::new();
        for (boundary, given) in partition.inputs().iter().zip(inputs) {
            if !given.is_shape_known() {
                return Err(CompileError::UnknownShape {
                    tensor: boundary.id,
                    shape: given.shape.clone(),
                });
            }
            let tensor = resolve_layout(LogicalTensor {
                id: boundary.id,
                ..given.clone()
            })?;
            values.insert(boundary.id, tensor);
        }
        let declared: HashMap<TensorId, &LogicalTensor> = partition
            .outputs()
            .iter()
            .map(|boundary| boundary.id)
            .zip(outputs)
            .collect();

        let mut steps = Vec::with_capacity(partition.len());
        for op in partition.ops() {
            let produced = lower_op(op, &mut values, &declared)?;
            steps.push(KernelStep {
                name: op.kind.as_str().to_string(),
                ops: vec![op.id],
                kinds: vec![op.kind],
                inputs: op.inputs.clone(),
                outputs: produced,
            });
        }

        let resolved_inputs: Vec<LogicalTensor> = partition
            .inputs()
            .iter()
            .filter_map(|boundary| values.get(&boundary.id).cloned())
            .collect();
        let resolved_outputs = partition
            .outputs()
            .iter()
            .map(|boundary| {
                values.get(&boundary.id).cloned().ok_or_else(|| {
                    CompileError::Backend(format!(
                        "partition {} never computes output {}",
                        partition.id(),
                        boundary.id
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (steps, workspace_bytes) = match partition.fused_op() {
            // Fused kernels keep intermediates on chip.
            Some(fused) => {
                let step = KernelStep {
                    name: fused
                        .fused_kind()
                        .unwrap_or(fused.kind.as_str())
                        .to_string(),
                    ops: partition.op_ids(),
                    kinds: partition.ops().iter().map(|op| op.kind).collect(),
                    inputs: resolved_inputs.iter().map(|tensor| tensor.id).collect(),
                    outputs: resolved_outputs.clone(),
                };
                (vec![step], 0)
            }
            None => {
                let boundary: HashSet<TensorId> = resolved_inputs
                    .iter()
                    .chain(&resolved_outputs)
                    .map(|tensor| tensor.id)
                    .collect();
                let workspace: usize = steps
                    .iter()
                    .flat_map(|step| &step.outputs)
                    .filter(|tensor| !boundary.contains(&tensor.id))
                    .filter_map(LogicalTensor::size_in_bytes)
                    .sum();
                (steps, workspace)
            }
        };

        tracing::debug!(
            partition = %partition.id(),
            pattern = partition.pattern_name().unwrap_or("-"),
            steps = steps.len(),
            workspace_bytes,
            "lowered partition"
        );
        Ok(KernelPlan {
            partition: partition.id(),
            backend: BACKEND_NAME.to_string(),
            inputs: resolved_inputs,
            outputs: resolved_outputs,
            steps,
            workspace_bytes,
            generation: self.engine.generation(),
            bound_ops: partition.op_ids(),
            bound_tensors: binding_order(partition),
        })
    }
}

fn check_arity(what: &'static str, expected: usize, found: usize) -> Result<(), CompileError> {
    if expected == found {
        Ok(())
    } else {
        Err(CompileError::ArityMismatch {
            what,
            expected,
            found,
        })
    }
}

/// Resolves the outputs of `op` and records them in `values`.
fn lower_op(
    op: &Op,
    values: &mut HashMap<TensorId, LogicalTensor>,
    declared: &HashMap<TensorId, &LogicalTensor>,
) -> Result<Vec<LogicalTensor>, CompileError> {
    let operands = op
        .inputs
        .iter()
        .map(|id| {
            values.get(id).ok_or_else(|| {
                CompileError::Backend(format!("{} reads {id} before it is computed", op.id))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let shapes: Vec<&[i64]> = operands.iter().map(|tensor| tensor.shape.as_slice()).collect();
    let inferred = infer_output_shape(op, &shapes)?;
    let fallback_dtype = internal_dtype(op, operands.first().map(|tensor| tensor.dtype));

    let mut produced = Vec::with_capacity(op.outputs.len());
    for (port, id) in op.outputs.iter().enumerate() {
        let expected = declared.get(id).copied();
        let inferred = inferred.as_ref().filter(|_| port == 0);
        let shape = match (inferred, expected) {
            (Some(shape), Some(expected))
                if expected.is_shape_known() && expected.shape != *shape =>
            {
                return Err(CompileError::ShapeMismatch {
                    tensor: *id,
                    expected: expected.shape.clone(),
                    found: shape.clone(),
                })
            }
            (Some(shape), _) => shape.clone(),
            (None, Some(expected)) if expected.is_shape_known() => expected.shape.clone(),
            (None, _) => {
                return Err(CompileError::UnsupportedOp {
                    kind: op.kind,
                    reason: format!("cannot infer the shape of output {port}"),
                })
            }
        };
        let dtype = expected
            .map(|tensor| tensor.dtype)
            .filter(|dtype| *dtype != DType::Undef)
            .unwrap_or(fallback_dtype);
        let layout = expected.map_or(Layout::Any, |tensor| tensor.layout.clone());
        let tensor = resolve_layout(LogicalTensor {
            id: *id,
            dtype,
            shape,
            layout,
        })?;
        values.insert(*id, tensor.clone());
        produced.push(tensor);
    }
    Ok(produced)
}

/// Element type of an intermediate value nobody declared.
fn internal_dtype(op: &Op, first_input: Option<DType>) -> DType {
    match op.kind {
        OpKind::Dequantize | OpKind::DynamicDequantize => DType::F32,
        OpKind::Quantize | OpKind::DynamicQuantize | OpKind::TypeCast => DType::Undef,
        _ => first_input.unwrap_or(DType::Undef),
    }
}

/// Picks row-major strides for tensors whose layout is left to the compiler.
fn resolve_layout(tensor: LogicalTensor) -> Result<LogicalTensor, CompileError> {
    match &tensor.layout {
        Layout::Any | Layout::Undef => {
            let strides =
                contiguous_strides(&tensor.shape).ok_or_else(|| CompileError::UnknownShape {
                    tensor: tensor.id,
                    shape: tensor.shape.clone(),
                })?;
            Ok(tensor.with_layout(Layout::Strided(strides)))
        }
        Layout::Strided(strides) if strides.len() != tensor.rank() => Err(CompileError::Backend(
            format!(
                "tensor {} has {} strides for rank {}",
                tensor.id,
                strides.len(),
                tensor.rank()
            ),
        )),
        Layout::Strided(_) | Layout::Opaque(_) => Ok(tensor),
    }
}
