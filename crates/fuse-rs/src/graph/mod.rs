//! Computation graph: logical tensors, ops and the structural index over them.

pub mod builder;
pub mod index;
pub mod op;
pub mod rewriter;
pub mod tensor;
pub mod topology;

use std::collections::{BTreeMap, HashSet};

use thiserror::Error;

pub use builder::GraphBuilder;
pub use index::{GraphIndex, PortUse};
pub use op::{AttrValue, Attributes, Op, OpId, OpKind, FUSED_KIND_ATTR, FUSED_OPS_ATTR};
pub use rewriter::GraphRewriter;
pub use tensor::{contiguous_strides, DType, Layout, LogicalTensor, TensorId, DIM_UNKNOWN};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("tensor {tensor} is already registered")]
    DuplicateTensor { tensor: TensorId },
    #[error("op {op} is already part of the graph")]
    DuplicateOp { op: OpId },
    #[error("tensor {tensor} is not registered in the graph")]
    UnknownTensor { tensor: TensorId },
    #[error("op {op} is not part of the graph")]
    UnknownOp { op: OpId },
    #[error("tensor {tensor} is already produced by {producer}")]
    TensorAlreadyProduced { tensor: TensorId, producer: OpId },
    #[error("op {op} produces tensor {tensor} which an earlier op already consumes")]
    OutputConsumedEarlier { op: OpId, tensor: TensorId },
    #[error("op {op} consumes its own output {tensor}")]
    SelfLoop { op: OpId, tensor: TensorId },
    #[error("cannot change rank of tensor {tensor} from {expected} to {found}")]
    RankMismatch {
        tensor: TensorId,
        expected: usize,
        found: usize,
    },
    #[error("contracting {members} ops would introduce a cycle")]
    CycleAfterContraction { members: usize },
}

/// Directed acyclic graph of ops connected by logical tensors.
///
/// Ops are kept in insertion order, which is always a valid topological
/// order: `add_op` rejects anything that would break it.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    ops: Vec<Op>,
    tensors: BTreeMap<TensorId, LogicalTensor>,
    index: GraphIndex,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tensor(&mut self, tensor: LogicalTensor) -> Result<TensorId, GraphError> {
        let id = tensor.id;
        if self.tensors.contains_key(&id) {
            return Err(GraphError::DuplicateTensor { tensor: id });
        }
        self.tensors.insert(id, tensor);
        Ok(id)
    }

    /// Refines the shape and layout of a registered tensor. Rank and identity never change.
    pub fn refine_tensor(
        &mut self,
        id: TensorId,
        shape: Vec<i64>,
        layout: Layout,
    ) -> Result<(), GraphError> {
        let tensor = self
            .tensors
            .get_mut(&id)
            .ok_or(GraphError::UnknownTensor { tensor: id })?;
        if tensor.shape.len() != shape.len() {
            return Err(GraphError::RankMismatch {
                tensor: id,
                expected: tensor.shape.len(),
                found: shape.len(),
            });
        }
        tensor.shape = shape;
        tensor.layout = layout;
        Ok(())
    }

    /// Appends an op whose inputs and outputs are registered tensors.
    pub fn add_op(&mut self, op: Op) -> Result<OpId, GraphError> {
        let tensors = &self.tensors;
        self.index
            .validate(&op, &|tensor| tensors.contains_key(&tensor))?;
        let id = op.id;
        self.index.record(self.ops.len(), &op);
        self.ops.push(op);
        Ok(id)
    }

    /// Ops in topological order.
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn op(&self, id: OpId) -> Option<&Op> {
        self.index.position(id).map(|position| &self.ops[position])
    }

    pub fn view(&self, id: OpId) -> Option<OpView<'_>> {
        self.op(id).map(|op| OpView { graph: self, op })
    }

    pub fn tensor(&self, id: TensorId) -> Option<&LogicalTensor> {
        self.tensors.get(&id)
    }

    pub fn tensors(&self) -> impl Iterator<Item = &LogicalTensor> {
        self.tensors.values()
    }

    pub fn index(&self) -> &GraphIndex {
        &self.index
    }

    pub fn position(&self, id: OpId) -> Option<usize> {
        self.index.position(id)
    }

    pub fn producer(&self, tensor: TensorId) -> Option<OpId> {
        self.index.producer(tensor).map(|(op, _)| op)
    }

    pub fn consumers(&self, tensor: TensorId) -> &[PortUse] {
        self.index.consumers(tensor)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn max_op_id(&self) -> Option<OpId> {
        self.ops.iter().map(|op| op.id).max()
    }

    /// Tensors consumed by some op but produced by none, in first-use order.
    pub fn input_tensors(&self) -> Vec<TensorId> {
        let mut seen = HashSet::new();
        let mut inputs = Vec::new();
        for op in &self.ops {
            for input in &op.inputs {
                if self.index.producer(*input).is_none() && seen.insert(*input) {
                    inputs.push(*input);
                }
            }
        }
        inputs
    }

    /// Tensors produced by some op and consumed by none, in production order.
    pub fn output_tensors(&self) -> Vec<TensorId> {
        self.ops
            .iter()
            .flat_map(|op| op.outputs.iter().copied())
            .filter(|output| !self.index.is_consumed(*output))
            .collect()
    }

    /// Replaces the op list wholesale, revalidating the topological order.
    pub(crate) fn reset_ops(&mut self, ops: Vec<Op>) -> Result<(), GraphError> {
        let tensors = &self.tensors;
        let index = GraphIndex::build(&ops, &|tensor| tensors.contains_key(&tensor))?;
        self.ops = ops;
        self.index = index;
        Ok(())
    }

    pub(crate) fn retain_tensors(&mut self, keep: impl Fn(TensorId) -> bool) {
        self.tensors.retain(|id, _| keep(*id));
    }
}

/// Read-only view of one op together with the graph it lives in.
///
/// Decision functions receive this view, so they can look at tensor
/// descriptors and neighbours without being able to mutate anything.
#[derive(Debug, Clone, Copy)]
pub struct OpView<'g> {
    graph: &'g Graph,
    op: &'g Op,
}

impl<'g> OpView<'g> {
    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    pub fn op(&self) -> &'g Op {
        self.op
    }

    pub fn id(&self) -> OpId {
        self.op.id
    }

    pub fn kind(&self) -> OpKind {
        self.op.kind
    }

    pub fn attr(&self, name: &str) -> Option<&'g AttrValue> {
        self.op.attrs.get(name)
    }

    pub fn num_inputs(&self) -> usize {
        self.op.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.op.outputs.len()
    }

    pub fn input(&self, port: usize) -> Option<&'g LogicalTensor> {
        self.op
            .inputs
            .get(port)
            .and_then(|id| self.graph.tensor(*id))
    }

    pub fn output(&self, port: usize) -> Option<&'g LogicalTensor> {
        self.op
            .outputs
            .get(port)
            .and_then(|id| self.graph.tensor(*id))
    }

    pub fn inputs(&self) -> impl Iterator<Item = &'g LogicalTensor> + 'g {
        let graph = self.graph;
        self.op.inputs.iter().filter_map(move |id| graph.tensor(*id))
    }

    pub fn outputs(&self) -> impl Iterator<Item = &'g LogicalTensor> + 'g {
        let graph = self.graph;
        self.op.outputs.iter().filter_map(move |id| graph.tensor(*id))
    }

    /// Op producing the input at `port`, if it is not a graph input.
    pub fn producer_of_input(&self, port: usize) -> Option<OpView<'g>> {
        let tensor = *self.op.inputs.get(port)?;
        let producer = self.graph.producer(tensor)?;
        self.graph.view(producer)
    }

    /// Consumers of the output at `port`.
    pub fn output_consumers(&self, port: usize) -> &'g [PortUse] {
        match self.op.outputs.get(port) {
            Some(tensor) => self.graph.consumers(*tensor),
            None => &[],
        }
    }
}
