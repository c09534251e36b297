//! Standard pattern library shared by backends.
//!
//! Priorities decide which pattern claims an op first: quantized patterns
//! outrank compute-plus-post-op patterns, which outrank pure eltwise chains.
//! `single_op_partition` runs last and claims whatever is left.

mod conv;
mod eltwise;
mod matmul;
mod misc;
mod quantized;

use std::sync::Arc;

use crate::graph::{DType, OpKind};
use crate::pattern::{BuildError, PatternGraph, PatternRegistryBuilder};

pub use misc::SINGLE_OP_KINDS;

/// Binary ops allowed as post-ops and in eltwise chains.
pub const BINARY_POST_OPS: &[OpKind] = &[
    OpKind::Add,
    OpKind::Multiply,
    OpKind::Maximum,
    OpKind::Minimum,
    OpKind::Divide,
    OpKind::Subtract,
];

pub(crate) const QUANTIZED: &[DType] = &[DType::S8, DType::U8];

/// Registers every standard pattern under `backend`.
pub fn register_standard_patterns(
    builder: &mut PatternRegistryBuilder,
    backend: &str,
) -> Result<(), BuildError> {
    quantized::register(builder, backend)?;
    conv::register(builder, backend)?;
    matmul::register(builder, backend)?;
    misc::register(builder, backend)?;
    eltwise::register(builder, backend)?;
    Ok(())
}

/// One op of any unary eltwise kind or binary post-op kind, chained through port 0.
pub(crate) fn post_op() -> Result<Arc<PatternGraph>, BuildError> {
    let kinds = OpKind::ELTWISE_UNARY
        .iter()
        .chain(BINARY_POST_OPS)
        .copied();
    PatternGraph::single_op(kinds).map(Arc::new)
}

pub(crate) fn single(kinds: &[OpKind]) -> Result<Arc<PatternGraph>, BuildError> {
    PatternGraph::single_op(kinds.iter().copied()).map(Arc::new)
}
