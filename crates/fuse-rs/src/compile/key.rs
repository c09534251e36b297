use serde::Serialize;

use crate::compile::CompileError;
use crate::fusion::Partition;
use crate::graph::LogicalTensor;
use crate::hashing::{combine_hashes, fnv1a_hash, hash_serializable};
use crate::signature::{self, Canonicalizer};

/// Identity of a compiled partition: backend, partition structure and the
/// concrete boundary descriptors it was compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PartitionKey {
    pub backend_hash: u64,
    pub structure_hash: u64,
    pub dtype_hash: u64,
    pub shape_hash: u64,
    pub layout_hash: u64,
    pub hash: u64,
}

/// First component that differs between two keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyChange {
    FirstSeen,
    Backend,
    Structure,
    DType,
    Shape,
    Layout,
    Identical,
}

impl KeyChange {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyChange::FirstSeen => "first_seen",
            KeyChange::Backend => "backend",
            KeyChange::Structure => "structure",
            KeyChange::DType => "dtype",
            KeyChange::Shape => "shape",
            KeyChange::Layout => "layout",
            KeyChange::Identical => "identical",
        }
    }
}

impl PartitionKey {
    pub fn new(
        backend: &str,
        partition: &Partition,
        inputs: &[LogicalTensor],
        outputs: &[LogicalTensor],
    ) -> Result<Self, CompileError> {
        let signature_error = |err: bincode::Error| CompileError::Signature(err.to_string());

        let mut canon = Canonicalizer::default();
        for tensor in partition.inputs().iter().chain(partition.outputs()) {
            canon.canon_tensor(tensor.id);
        }
        let ops_hash = canon
            .structure_hash(partition.ops())
            .map_err(signature_error)?;
        let fused_hash = hash_serializable(&partition.fused_op().map(|op| (&op.kind, &op.attrs)))
            .map_err(signature_error)?;
        let arity_hash = hash_serializable(&(inputs.len(), outputs.len())).map_err(signature_error)?;
        let structure_hash = combine_hashes(&[ops_hash, fused_hash, arity_hash]);

        let backend_hash = fnv1a_hash(backend.as_bytes());
        let dtype_hash = combine_hashes(&[
            signature::dtype_hash(inputs).map_err(signature_error)?,
            signature::dtype_hash(outputs).map_err(signature_error)?,
        ]);
        let shape_hash = combine_hashes(&[
            signature::shape_hash(inputs).map_err(signature_error)?,
            signature::shape_hash(outputs).map_err(signature_error)?,
        ]);
        let layout_hash = combine_hashes(&[
            signature::layout_hash(inputs).map_err(signature_error)?,
            signature::layout_hash(outputs).map_err(signature_error)?,
        ]);
        let hash = combine_hashes(&[
            backend_hash,
            structure_hash,
            dtype_hash,
            shape_hash,
            layout_hash,
        ]);
        Ok(PartitionKey {
            backend_hash,
            structure_hash,
            dtype_hash,
            shape_hash,
            layout_hash,
            hash,
        })
    }

    /// Explains a cache miss by comparing against the previous key seen for the same slot.
    pub fn classify_change_from(&self, previous: Option<&PartitionKey>) -> KeyChange {
        let Some(previous) = previous else {
            return KeyChange::FirstSeen;
        };
        if self.backend_hash != previous.backend_hash {
            KeyChange::Backend
        } else if self.structure_hash != previous.structure_hash {
            KeyChange::Structure
        } else if self.dtype_hash != previous.dtype_hash {
            KeyChange::DType
        } else if self.shape_hash != previous.shape_hash {
            KeyChange::Shape
        } else if self.layout_hash != previous.layout_hash {
            KeyChange::Layout
        } else {
            KeyChange::Identical
        }
    }
}
