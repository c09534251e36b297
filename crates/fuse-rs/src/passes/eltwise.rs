use crate::graph::OpKind;
use crate::pattern::{
    fused_op_with_post_ops, in_edge, BuildError, PartitionCategory, PatternAction, PatternGraph,
    PatternGraphBuilder, PatternRegistryBuilder, PortMap, Repetition,
};
use crate::passes::{single, BINARY_POST_OPS};

const ELTWISE_BINARY_PRIORITY: f32 = 8.2;
const ELTWISE_CHAIN_PRIORITY: f32 = 7.0;

const CHAIN: PortMap = PortMap {
    output: 0,
    input: 0,
};

pub(super) fn register(builder: &mut PatternRegistryBuilder, backend: &str) -> Result<(), BuildError> {
    builder.register(
        "eltwise_binary_fusion",
        backend,
        relu_binary_chain()?,
        ELTWISE_BINARY_PRIORITY,
        PartitionCategory::EltwisePostOps,
        PatternAction::Fuse(fused_op_with_post_ops("eltwise_binary")),
    )?;
    builder.register(
        "eltwise_chain_fusion",
        backend,
        unary_chain()?,
        ELTWISE_CHAIN_PRIORITY,
        PartitionCategory::EltwisePostOps,
        PatternAction::Fuse(fused_op_with_post_ops("eltwise_chain")),
    )?;
    Ok(())
}

/// ReLU followed by one or more binary ops.
fn relu_binary_chain() -> Result<PatternGraph, BuildError> {
    let mut pattern = PatternGraphBuilder::new();
    let relu = pattern.append_op([OpKind::ReLU], [])?;
    pattern.append_repetition(
        single(BINARY_POST_OPS)?,
        CHAIN,
        1,
        Repetition::UNBOUNDED,
        [in_edge(0, relu, 0)],
    )?;
    pattern.finish()
}

/// Two or more unary eltwise ops in a row.
fn unary_chain() -> Result<PatternGraph, BuildError> {
    let mut pattern = PatternGraphBuilder::new();
    let head = pattern.append_op(OpKind::ELTWISE_UNARY.iter().copied(), [])?;
    pattern.append_repetition(
        single(OpKind::ELTWISE_UNARY)?,
        CHAIN,
        1,
        Repetition::UNBOUNDED,
        [in_edge(0, head, 0)],
    )?;
    pattern.finish()
}
