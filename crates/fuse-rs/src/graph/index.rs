use std::collections::HashMap;

use smallvec::SmallVec;

use crate::graph::op::{Op, OpId};
use crate::graph::tensor::TensorId;
use crate::graph::GraphError;

/// `(op, port)` pair naming one end of a data edge.
pub type PortUse = (OpId, usize);

/// Structural indices over the op list of a graph.
///
/// Positions double as a topological order: every op appears after the
/// producers of all of its inputs.
#[derive(Debug, Clone, Default)]
pub struct GraphIndex {
    position: HashMap<OpId, usize>,
    producer: HashMap<TensorId, PortUse>,
    consumers: HashMap<TensorId, SmallVec<[PortUse; 4]>>,
}

impl GraphIndex {
    /// Builds indices for `ops` and validates that the list is in topological order.
    pub fn build<'a>(
        ops: impl IntoIterator<Item = &'a Op>,
        known: &dyn Fn(TensorId) -> bool,
    ) -> Result<Self, GraphError> {
        let mut index = GraphIndex::default();
        for (position, op) in ops.into_iter().enumerate() {
            index.validate(op, known)?;
            index.record(position, op);
        }
        Ok(index)
    }

    /// Checks that `op` can be appended after every op indexed so far.
    pub fn validate(&self, op: &Op, known: &dyn Fn(TensorId) -> bool) -> Result<(), GraphError> {
        if self.position.contains_key(&op.id) {
            return Err(GraphError::DuplicateOp { op: op.id });
        }
        for input in &op.inputs {
            if !known(*input) {
                return Err(GraphError::UnknownTensor { tensor: *input });
            }
        }
        for (port, output) in op.outputs.iter().enumerate() {
            if !known(*output) {
                return Err(GraphError::UnknownTensor { tensor: *output });
            }
            if op.outputs[..port].contains(output) {
                return Err(GraphError::TensorAlreadyProduced {
                    tensor: *output,
                    producer: op.id,
                });
            }
            if let Some((producer, _)) = self.producer.get(output) {
                return Err(GraphError::TensorAlreadyProduced {
                    tensor: *output,
                    producer: *producer,
                });
            }
            if op.inputs.contains(output) {
                return Err(GraphError::SelfLoop {
                    op: op.id,
                    tensor: *output,
                });
            }
            if self.consumers.contains_key(output) {
                return Err(GraphError::OutputConsumedEarlier {
                    op: op.id,
                    tensor: *output,
                });
            }
        }
        Ok(())
    }

    /// Records `op` at `position`; callers validate first.
    pub fn record(&mut self, position: usize, op: &Op) {
        self.position.insert(op.id, position);
        for (port, input) in op.inputs.iter().enumerate() {
            self.consumers.entry(*input).or_default().push((op.id, port));
        }
        for (port, output) in op.outputs.iter().enumerate() {
            self.producer.insert(*output, (op.id, port));
        }
    }

    pub fn position(&self, op: OpId) -> Option<usize> {
        self.position.get(&op).copied()
    }

    pub fn producer(&self, tensor: TensorId) -> Option<PortUse> {
        self.producer.get(&tensor).copied()
    }

    /// Consumers of `tensor` in topological order.
    pub fn consumers(&self, tensor: TensorId) -> &[PortUse] {
        self.consumers
            .get(&tensor)
            .map(|uses| uses.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_consumed(&self, tensor: TensorId) -> bool {
        self.consumers.contains_key(&tensor)
    }

    pub fn len(&self) -> usize {
        self.position.len()
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_empty()
    }
}
