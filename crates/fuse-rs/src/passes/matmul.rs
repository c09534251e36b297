use crate::graph::OpKind;
use crate::pattern::{
    fused_op_with_post_ops, in_edge, BuildError, PartitionCategory, PatternAction, PatternGraph,
    PatternGraphBuilder, PatternRegistryBuilder, PortMap,
};
use crate::passes::{single, BINARY_POST_OPS};

const MATMUL_POST_OPS_PRIORITY: f32 = 9.5;
const MAX_POST_OPS: usize = 4;

pub(super) fn register(builder: &mut PatternRegistryBuilder, backend: &str) -> Result<(), BuildError> {
    builder.register(
        "matmul_post_ops_fusion",
        backend,
        matmul_with_post_ops()?,
        MATMUL_POST_OPS_PRIORITY,
        PartitionCategory::MatMulPostOps,
        PatternAction::Fuse(fused_op_with_post_ops("matmul_post_ops")),
    )?;
    Ok(())
}

/// MatMul followed by one to four of BiasAdd, unary eltwise or binary ops.
fn matmul_with_post_ops() -> Result<PatternGraph, BuildError> {
    let mut kinds = vec![OpKind::BiasAdd];
    kinds.extend_from_slice(OpKind::ELTWISE_UNARY);
    kinds.extend_from_slice(BINARY_POST_OPS);

    let mut pattern = PatternGraphBuilder::new();
    let matmul = pattern.append_op([OpKind::MatMul], [])?;
    pattern.append_repetition(
        single(&kinds)?,
        PortMap {
            output: 0,
            input: 0,
        },
        1,
        MAX_POST_OPS,
        [in_edge(0, matmul, 0)],
    )?;
    pattern.finish()
}
