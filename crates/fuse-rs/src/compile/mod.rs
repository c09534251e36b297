//! Backend compilation seam and the compiled-partition cache in front of it.

mod cache;
mod key;

use thiserror::Error;

use crate::fusion::{Partition, PartitionId};
use crate::graph::{LogicalTensor, OpKind, TensorId};

pub use cache::{
    CacheConfig, CacheError, CacheStats, CompileResult, CompiledPartitionCache, FailurePolicy,
    SharedResult, DEFAULT_CACHE_CAPACITY,
};
pub use key::{KeyChange, PartitionKey};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("partition {partition} is not supported by backend {backend}")]
    Unsupported {
        partition: PartitionId,
        backend: String,
    },
    #[error("expected {expected} {what} descriptors, got {found}")]
    ArityMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("tensor {tensor} has unknown dimensions {shape:?}")]
    UnknownShape { tensor: TensorId, shape: Vec<i64> },
    #[error("{kind} is not supported: {reason}")]
    UnsupportedOp { kind: OpKind, reason: String },
    #[error("shape mismatch for tensor {tensor}: expected {expected:?}, got {found:?}")]
    ShapeMismatch {
        tensor: TensorId,
        expected: Vec<i64>,
        found: Vec<i64>,
    },
    #[error("backend error: {0}")]
    Backend(String),
    #[error("partition compile panicked: {0}")]
    Panicked(String),
    #[error("failed to fingerprint partition: {0}")]
    Signature(String),
}

/// Turns a partition plus concrete boundary descriptors into a backend artifact.
pub trait PartitionCompiler: Send + Sync {
    type Artifact: Send + Sync + 'static;

    fn backend_name(&self) -> &str;

    fn compile(
        &self,
        partition: &Partition,
        inputs: &[LogicalTensor],
        outputs: &[LogicalTensor],
    ) -> Result<Self::Artifact, CompileError>;
}

/// Engine state that cached artifacts depend on. A generation change
/// invalidates artifacts compiled before it.
pub trait EngineProbe: Send + Sync {
    fn generation(&self) -> u64;
}

/// Compiles `partition` through `cache`, reusing an existing or in-flight result.
pub fn compile_partition<C: PartitionCompiler>(
    cache: &CompiledPartitionCache<C::Artifact>,
    compiler: &C,
    partition: &Partition,
    inputs: &[LogicalTensor],
    outputs: &[LogicalTensor],
) -> Result<SharedResult<C::Artifact>, CompileError> {
    let key = PartitionKey::new(compiler.backend_name(), partition, inputs, outputs)?;
    Ok(cache.get_or_add(key, || compiler.compile(partition, inputs, outputs)))
}

/// Whether a result for this partition and descriptor set is cached.
pub fn is_cached<C: PartitionCompiler>(
    cache: &CompiledPartitionCache<C::Artifact>,
    compiler: &C,
    partition: &Partition,
    inputs: &[LogicalTensor],
    outputs: &[LogicalTensor],
) -> Result<bool, CompileError> {
    let key = PartitionKey::new(compiler.backend_name(), partition, inputs, outputs)?;
    Ok(cache.contains(&key))
}
