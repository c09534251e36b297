use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use crate::graph::rewriter::{boundary, ordered_members};
use crate::graph::{Graph, LogicalTensor, Op, OpId, TensorId};
use crate::pattern::PartitionCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PartitionId(pub u64);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// A group of ops of the input graph that one backend compiles together.
///
/// Ops are copies taken from the input graph in topological order. Inputs
/// and outputs are frozen boundary descriptors at partitioning time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Partition {
    id: PartitionId,
    ops: Vec<Op>,
    inputs: Vec<LogicalTensor>,
    outputs: Vec<LogicalTensor>,
    supported: bool,
    backend: Option<String>,
    category: Option<PartitionCategory>,
    pattern: Option<String>,
    fused_op: Option<Op>,
}

/// Pattern-derived metadata of a supported partition.
#[derive(Debug, Clone)]
pub(crate) struct PartitionOrigin {
    pub backend: String,
    pub category: PartitionCategory,
    pub pattern: String,
    pub fused_op: Option<Op>,
}

impl Partition {
    pub(crate) fn build(
        id: PartitionId,
        graph: &Graph,
        members: &HashSet<OpId>,
        origin: Option<PartitionOrigin>,
    ) -> Self {
        let ops: Vec<Op> = ordered_members(graph, members)
            .into_iter()
            .filter_map(|member| graph.op(member).cloned())
            .collect();
        let edges = boundary(graph, members);
        let describe = |ids: Vec<TensorId>| -> Vec<LogicalTensor> {
            ids.into_iter()
                .filter_map(|id| graph.tensor(id).cloned())
                .collect()
        };
        let inputs = describe(edges.inputs);
        let outputs = describe(edges.outputs);
        match origin {
            Some(origin) => Partition {
                id,
                ops,
                inputs,
                outputs,
                supported: true,
                backend: Some(origin.backend),
                category: Some(origin.category),
                pattern: Some(origin.pattern),
                fused_op: origin.fused_op,
            },
            None => Partition {
                id,
                ops,
                inputs,
                outputs,
                supported: false,
                backend: None,
                category: None,
                pattern: None,
                fused_op: None,
            },
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn op_ids(&self) -> Vec<OpId> {
        self.ops.iter().map(|op| op.id).collect()
    }

    pub fn contains(&self, op: OpId) -> bool {
        self.ops.iter().any(|member| member.id == op)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn inputs(&self) -> &[LogicalTensor] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[LogicalTensor] {
        &self.outputs
    }

    /// False for singleton partitions no pattern claimed.
    pub fn is_supported(&self) -> bool {
        self.supported
    }

    pub fn backend(&self) -> Option<&str> {
        self.backend.as_deref()
    }

    pub fn category(&self) -> Option<PartitionCategory> {
        self.category
    }

    pub fn pattern_name(&self) -> Option<&str> {
        self.pattern.as_deref()
    }

    /// The fused node spliced into the working graph, for fuse-action patterns.
    pub fn fused_op(&self) -> Option<&Op> {
        self.fused_op.as_ref()
    }

    pub fn fused_kind(&self) -> Option<&str> {
        self.fused_op.as_ref().and_then(Op::fused_kind)
    }
}
