use std::collections::HashSet;

use crate::graph::{OpId, TensorId};
use crate::pattern::{NodeId, PatternGraph, PortDirection};

/// How the solver reaches a pattern node for the first time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Entry {
    /// The node must bind the given concrete op.
    Anchor(OpId),
    /// The node's input `port` must consume `tensor`.
    Input { port: usize, tensor: TensorId },
    /// The node's output `port` must produce `tensor`.
    Output { port: usize, tensor: TensorId },
}

impl Entry {
    /// Translates an entry on a composite node's port into an entry on the
    /// inner node that port is bound to.
    pub(crate) fn into_subgraph(self, subgraph: &PatternGraph) -> Option<(NodeId, Entry)> {
        match self {
            Entry::Anchor(op) => Some((subgraph.anchor(), Entry::Anchor(op))),
            Entry::Input { port, tensor } => {
                let inner = subgraph.port(PortDirection::Input, port)?;
                Some((
                    inner.node,
                    Entry::Input {
                        port: inner.port,
                        tensor,
                    },
                ))
            }
            Entry::Output { port, tensor } => {
                let inner = subgraph.port(PortDirection::Output, port)?;
                Some((
                    inner.node,
                    Entry::Output {
                        port: inner.port,
                        tensor,
                    },
                ))
            }
        }
    }
}

/// Tensors seen at the ports of one bound pattern node.
///
/// For op nodes these are the op's own inputs and outputs (inputs possibly
/// swapped for commutative ops); for composite nodes they are the ports the
/// sub-pattern exposes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct NodeBinding {
    pub inputs: Vec<Option<TensorId>>,
    pub outputs: Vec<Option<TensorId>>,
}

impl NodeBinding {
    pub(crate) fn with_ports(inputs: usize, outputs: usize) -> Self {
        NodeBinding {
            inputs: vec![None; inputs],
            outputs: vec![None; outputs],
        }
    }

    pub(crate) fn input(&self, port: usize) -> Option<TensorId> {
        self.inputs.get(port).copied().flatten()
    }

    pub(crate) fn output(&self, port: usize) -> Option<TensorId> {
        self.outputs.get(port).copied().flatten()
    }
}

/// Concrete ops bound so far along the current search branch.
///
/// The solver shares one state across the whole search: binding an op
/// pushes it, and backtracking truncates back to a mark taken earlier.
#[derive(Debug, Clone, Default)]
pub(crate) struct MatchState {
    order: Vec<OpId>,
    members: HashSet<OpId>,
}

impl MatchState {
    pub(crate) fn contains(&self, op: OpId) -> bool {
        self.members.contains(&op)
    }

    pub(crate) fn push(&mut self, op: OpId) {
        self.order.push(op);
        self.members.insert(op);
    }

    /// Number of bound ops; usable as a mark for [`MatchState::truncate`].
    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    /// Unbinds every op pushed after the state had `len` ops.
    pub(crate) fn truncate(&mut self, len: usize) {
        if len >= self.order.len() {
            return;
        }
        for op in self.order.drain(len..) {
            self.members.remove(&op);
        }
    }

    pub(crate) fn members(&self) -> &HashSet<OpId> {
        &self.members
    }

    pub(crate) fn into_ops(self) -> Vec<OpId> {
        self.order
    }
}
