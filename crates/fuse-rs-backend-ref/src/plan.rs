use std::collections::{HashMap, HashSet};

use serde::Serialize;

use fuse_rs::fusion::{Partition, PartitionId};
use fuse_rs::graph::{LogicalTensor, OpId, OpKind, TensorId};

/// One kernel launch of a compiled partition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KernelStep {
    /// Kernel name: the fused kind for fused partitions, the op kind otherwise.
    pub name: String,
    /// Ops of the input graph this kernel covers.
    pub ops: Vec<OpId>,
    pub kinds: Vec<OpKind>,
    pub inputs: Vec<TensorId>,
    /// Resolved descriptors of the values the kernel writes.
    pub outputs: Vec<LogicalTensor>,
}

impl KernelStep {
    pub fn is_fused(&self) -> bool {
        self.ops.len() > 1
    }
}

/// Shape and layout resolved schedule for one partition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KernelPlan {
    pub partition: PartitionId,
    pub backend: String,
    pub inputs: Vec<LogicalTensor>,
    pub outputs: Vec<LogicalTensor>,
    pub steps: Vec<KernelStep>,
    /// Bytes of scratch memory for values that never leave the partition.
    pub workspace_bytes: usize,
    /// Engine generation the plan was compiled against.
    pub generation: u64,
    /// Member ops and tensors of the partition the ids above refer to, in
    /// binding order.
    #[serde(skip)]
    pub(crate) bound_ops: Vec<OpId>,
    #[serde(skip)]
    pub(crate) bound_tensors: Vec<TensorId>,
}

impl KernelPlan {
    pub fn num_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn step(&self, name: &str) -> Option<&KernelStep> {
        self.steps.iter().find(|step| step.name == name)
    }

    /// Whether the ids in this plan are the ones of `partition`.
    pub fn is_bound_to(&self, partition: &Partition) -> bool {
        self.partition == partition.id()
            && self.bound_ops == partition.op_ids()
            && self.bound_tensors == binding_order(partition)
    }

    /// Copy of this plan with op, tensor and partition ids renamed to those
    /// of `partition`.
    ///
    /// Cached plans are shared between partitions with the same structure, so
    /// member ops and tensors correspond by binding order. Returns `None` if
    /// `partition` does not line up with the plan.
    pub fn rebind(&self, partition: &Partition) -> Option<KernelPlan> {
        let ops = partition.op_ids();
        let tensors = binding_order(partition);
        if ops.len() != self.bound_ops.len() || tensors.len() != self.bound_tensors.len() {
            return None;
        }
        let op_map: HashMap<OpId, OpId> = self
            .bound_ops
            .iter()
            .copied()
            .zip(ops.iter().copied())
            .collect();
        let tensor_map: HashMap<TensorId, TensorId> = self
            .bound_tensors
            .iter()
            .copied()
            .zip(tensors.iter().copied())
            .collect();
        let tensor = |id: &TensorId| tensor_map.get(id).copied();
        let descriptor = |value: &LogicalTensor| {
            Some(LogicalTensor {
                id: tensor(&value.id)?,
                ..value.clone()
            })
        };

        let steps = self
            .steps
            .iter()
            .map(|step| {
                Some(KernelStep {
                    name: step.name.clone(),
                    ops: step
                        .ops
                        .iter()
                        .map(|op| op_map.get(op).copied())
                        .collect::<Option<_>>()?,
                    kinds: step.kinds.clone(),
                    inputs: step.inputs.iter().map(tensor).collect::<Option<_>>()?,
                    outputs: step.outputs.iter().map(descriptor).collect::<Option<_>>()?,
                })
            })
            .collect::<Option<Vec<_>>>()?;

        Some(KernelPlan {
            partition: partition.id(),
            backend: self.backend.clone(),
            inputs: self.inputs.iter().map(descriptor).collect::<Option<_>>()?,
            outputs: self.outputs.iter().map(descriptor).collect::<Option<_>>()?,
            steps,
            workspace_bytes: self.workspace_bytes,
            generation: self.generation,
            bound_ops: ops,
            bound_tensors: tensors,
        })
    }
}

/// Tensors of `partition`: boundary inputs, boundary outputs, then every
/// member input and output in op order, each listed once.
pub(crate) fn binding_order(partition: &Partition) -> Vec<TensorId> {
    let mut seen = HashSet::new();
    let boundary = partition
        .inputs()
        .iter()
        .chain(partition.outputs())
        .map(|tensor| tensor.id);
    let wiring = partition
        .ops()
        .iter()
        .flat_map(|op| op.inputs.iter().chain(&op.outputs).copied());
    boundary
        .chain(wiring)
        .filter(|id| seen.insert(*id))
        .collect()
}
