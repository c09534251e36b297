use crate::graph::op::{AttrValue, Op, OpId, OpKind};
use crate::graph::tensor::{DType, LogicalTensor, TensorId};
use crate::graph::{Graph, GraphError};

/// Convenience front-end that hands out sequential tensor and op ids.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: Graph,
    next_tensor: u64,
    next_op: u64,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an external input tensor.
    pub fn input(&mut self, dtype: DType, shape: impl Into<Vec<i64>>) -> Result<TensorId, GraphError> {
        let id = TensorId(self.next_tensor);
        self.next_tensor += 1;
        self.graph
            .add_tensor(LogicalTensor::strided(id, dtype, shape))
    }

    /// Appends a single-output op and returns its output tensor.
    pub fn op(
        &mut self,
        kind: OpKind,
        inputs: &[TensorId],
        dtype: DType,
        shape: impl Into<Vec<i64>>,
    ) -> Result<TensorId, GraphError> {
        self.op_with_attrs(kind, inputs, Vec::<(&str, AttrValue)>::new(), dtype, shape)
    }

    pub fn op_with_attrs<'a>(
        &mut self,
        kind: OpKind,
        inputs: &[TensorId],
        attrs: impl IntoIterator<Item = (&'a str, AttrValue)>,
        dtype: DType,
        shape: impl Into<Vec<i64>>,
    ) -> Result<TensorId, GraphError> {
        let (_, outputs) = self.op_multi(kind, inputs, attrs, vec![(dtype, shape.into())])?;
        Ok(outputs[0])
    }

    /// Appends an op with any number of outputs.
    pub fn op_multi<'a>(
        &mut self,
        kind: OpKind,
        inputs: &[TensorId],
        attrs: impl IntoIterator<Item = (&'a str, AttrValue)>,
        outputs: Vec<(DType, Vec<i64>)>,
    ) -> Result<(OpId, Vec<TensorId>), GraphError> {
        let mut output_ids = Vec::with_capacity(outputs.len());
        for (dtype, shape) in outputs {
            output_ids.push(self.input(dtype, shape)?);
        }
        let id = OpId(self.next_op);
        let mut op = Op::new(id, kind)
            .with_inputs(inputs.iter().copied())
            .with_outputs(output_ids.iter().copied());
        for (name, value) in attrs {
            op.attrs.insert(name.to_string(), value);
        }
        self.graph.add_op(op)?;
        self.next_op += 1;
        Ok((id, output_ids))
    }

    /// Id of the most recently appended op.
    pub fn last_op(&self) -> Option<OpId> {
        self.next_op.checked_sub(1).map(OpId)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn finish(self) -> Graph {
        self.graph
    }
}
