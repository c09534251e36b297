//! Id-independent fingerprints of op sequences and tensor descriptors.

use std::collections::HashMap;

use serde::Serialize;

use crate::graph::{Attributes, DType, Graph, Layout, LogicalTensor, Op, OpKind, TensorId};
use crate::hashing::{combine_hashes, hash_serializable};

#[derive(Serialize)]
struct SignatureOp<'a> {
    kind: OpKind,
    attrs: &'a Attributes,
    inputs: Vec<u32>,
    outputs: Vec<u32>,
}

#[derive(Serialize)]
struct SignatureTensor<'a> {
    dtype: DType,
    shape: &'a [i64],
    layout: &'a Layout,
}

/// Renames tensor ids to dense ordinals in first-seen order.
#[derive(Debug, Default)]
pub(crate) struct Canonicalizer {
    mapping: HashMap<TensorId, u32>,
    order: Vec<TensorId>,
}

impl Canonicalizer {
    pub(crate) fn canon_tensor(&mut self, tensor: TensorId) -> u32 {
        if let Some(id) = self.mapping.get(&tensor) {
            return *id;
        }
        let id = self.order.len() as u32;
        self.mapping.insert(tensor, id);
        self.order.push(tensor);
        id
    }

    /// Tensors in canonical order.
    pub(crate) fn order(&self) -> &[TensorId] {
        &self.order
    }

    /// Hash of kinds, attributes and wiring of `ops`, independent of their ids.
    pub(crate) fn structure_hash<'a>(
        &mut self,
        ops: impl IntoIterator<Item = &'a Op>,
    ) -> Result<u64, bincode::Error> {
        let signature: Vec<SignatureOp<'a>> = ops
            .into_iter()
            .map(|op| SignatureOp {
                kind: op.kind,
                attrs: &op.attrs,
                inputs: op.inputs.iter().map(|t| self.canon_tensor(*t)).collect(),
                outputs: op.outputs.iter().map(|t| self.canon_tensor(*t)).collect(),
            })
            .collect();
        hash_serializable(&signature)
    }
}

pub(crate) fn dtype_hash(tensors: &[LogicalTensor]) -> Result<u64, bincode::Error> {
    let dtypes: Vec<DType> = tensors.iter().map(|tensor| tensor.dtype).collect();
    hash_serializable(&dtypes)
}

pub(crate) fn shape_hash(tensors: &[LogicalTensor]) -> Result<u64, bincode::Error> {
    let shapes: Vec<&[i64]> = tensors.iter().map(|tensor| tensor.shape.as_slice()).collect();
    hash_serializable(&shapes)
}

pub(crate) fn layout_hash(tensors: &[LogicalTensor]) -> Result<u64, bincode::Error> {
    let layouts: Vec<&Layout> = tensors.iter().map(|tensor| &tensor.layout).collect();
    hash_serializable(&layouts)
}

/// Fingerprint of a whole graph: structure plus every tensor descriptor.
pub(crate) fn graph_signature(graph: &Graph) -> Result<u64, bincode::Error> {
    let mut canon = Canonicalizer::default();
    let structure = canon.structure_hash(graph.ops())?;
    let tensors: Vec<SignatureTensor<'_>> = canon
        .order()
        .iter()
        .filter_map(|id| graph.tensor(*id))
        .map(|tensor| SignatureTensor {
            dtype: tensor.dtype,
            shape: &tensor.shape,
            layout: &tensor.layout,
        })
        .collect();
    let descriptors = hash_serializable(&tensors)?;
    Ok(combine_hashes(&[structure, descriptors]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;

    fn chain(first_tensor_offset: usize, width: i64) -> Graph {
        let mut builder = GraphBuilder::new();
        for _ in 0..first_tensor_offset {
            builder.input(DType::F32, [1]).expect("padding input");
        }
        let x = builder.input(DType::F32, [width]).expect("input");
        let y = builder.op(OpKind::ReLU, &[x], DType::F32, [width]).expect("relu");
        builder.op(OpKind::Tanh, &[y], DType::F32, [width]).expect("tanh");
        builder.finish()
    }

    #[test]
    fn signature_ignores_ids_but_not_shapes() {
        let base = graph_signature(&chain(0, 8)).expect("signature");
        let renumbered = graph_signature(&chain(3, 8)).expect("signature");
        let reshaped = graph_signature(&chain(0, 16)).expect("signature");
        assert_eq!(base, renumbered);
        assert_ne!(base, reshaped);
    }
}
