use std::collections::HashSet;

use crate::graph::op::{AttrValue, Attributes, Op, OpId, OpKind, FUSED_KIND_ATTR, FUSED_OPS_ATTR};
use crate::graph::tensor::TensorId;
use crate::graph::topology::stable_topological_order;
use crate::graph::{Graph, GraphError};

/// Tensors crossing the boundary of a set of ops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Boundary {
    /// Tensors consumed by a member and not produced by one, in first-use order.
    pub inputs: Vec<TensorId>,
    /// Member outputs that escape the set or are graph outputs, in production order.
    pub outputs: Vec<TensorId>,
}

/// Orders `members` by their position in `graph`, dropping unknown ids.
pub fn ordered_members(graph: &Graph, members: &HashSet<OpId>) -> Vec<OpId> {
    let mut ordered: Vec<(usize, OpId)> = members
        .iter()
        .filter_map(|op| graph.position(*op).map(|position| (position, *op)))
        .collect();
    ordered.sort_unstable();
    ordered.into_iter().map(|(_, op)| op).collect()
}

pub fn boundary(graph: &Graph, members: &HashSet<OpId>) -> Boundary {
    let mut result = Boundary::default();
    let mut seen_inputs = HashSet::new();
    for member in ordered_members(graph, members) {
        let Some(op) = graph.op(member) else {
            continue;
        };
        for input in &op.inputs {
            let internal = graph
                .producer(*input)
                .is_some_and(|producer| members.contains(&producer));
            if !internal && seen_inputs.insert(*input) {
                result.inputs.push(*input);
            }
        }
        for output in &op.outputs {
            let consumers = graph.consumers(*output);
            let escapes = consumers.is_empty()
                || consumers
                    .iter()
                    .any(|(consumer, _)| !members.contains(consumer));
            if escapes {
                result.outputs.push(*output);
            }
        }
    }
    result
}

/// Mutable editor that contracts op sets into fused nodes.
pub struct GraphRewriter<'a> {
    graph: &'a mut Graph,
}

impl<'a> GraphRewriter<'a> {
    pub fn new(graph: &'a mut Graph) -> Self {
        Self { graph }
    }

    pub fn graph(&self) -> &Graph {
        &*self.graph
    }

    /// Replaces `members` by a single fused node with id `id`.
    ///
    /// The node consumes the boundary inputs and produces the boundary
    /// outputs of the set, so every external consumer stays wired to the
    /// same tensors. Returns a copy of the inserted node.
    pub fn fuse(
        &mut self,
        members: &HashSet<OpId>,
        id: OpId,
        fused_kind: &str,
        attrs: Attributes,
    ) -> Result<Op, GraphError> {
        for member in members {
            if self.graph.position(*member).is_none() {
                return Err(GraphError::UnknownOp { op: *member });
            }
        }
        let Boundary { inputs, outputs } = boundary(&*self.graph, members);
        let kinds: Vec<String> = ordered_members(&*self.graph, members)
            .into_iter()
            .filter_map(|member| self.graph.op(member))
            .map(|op| op.kind.as_str().to_string())
            .collect();

        let mut fused = Op::new(id, OpKind::FusedOp)
            .with_inputs(inputs)
            .with_outputs(outputs);
        fused.attrs = attrs;
        fused
            .attrs
            .insert(FUSED_KIND_ATTR.to_string(), AttrValue::from(fused_kind));
        fused
            .attrs
            .insert(FUSED_OPS_ATTR.to_string(), AttrValue::Strs(kinds));

        self.contract(members, fused.clone())?;
        Ok(fused)
    }

    /// Swaps `members` for `replacement` and restores a topological order.
    pub fn contract(&mut self, members: &HashSet<OpId>, replacement: Op) -> Result<(), GraphError> {
        if self.graph.position(replacement.id).is_some() && !members.contains(&replacement.id) {
            return Err(GraphError::DuplicateOp { op: replacement.id });
        }
        let kept_outputs: HashSet<TensorId> = replacement.outputs.iter().copied().collect();
        let mut dropped_tensors: HashSet<TensorId> = HashSet::new();
        let mut replacement = Some(replacement);
        let mut ops = Vec::with_capacity(self.graph.len());
        for op in self.graph.ops() {
            if members.contains(&op.id) {
                dropped_tensors.extend(
                    op.outputs
                        .iter()
                        .filter(|output| !kept_outputs.contains(output))
                        .copied(),
                );
                // The fused node takes the slot of the first member.
                if let Some(fused) = replacement.take() {
                    ops.push(fused);
                }
            } else {
                ops.push(op.clone());
            }
        }

        let ordered = stable_topological_order(ops).ok_or(GraphError::CycleAfterContraction {
            members: members.len(),
        })?;
        self.graph.reset_ops(ordered)?;
        self.graph
            .retain_tensors(|tensor| !dropped_tensors.contains(&tensor));
        Ok(())
    }
}
