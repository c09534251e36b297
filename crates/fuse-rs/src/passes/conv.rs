use crate::graph::OpKind;
use crate::pattern::{
    fused_op_with_post_ops, in_edge, BuildError, PartitionCategory, PatternAction, PatternGraph,
    PatternGraphBuilder, PatternRegistryBuilder, PortMap,
};
use crate::passes::post_op;

const CONV_BIAS_POST_OPS_PRIORITY: f32 = 9.7;
const CONV_POST_OPS_PRIORITY: f32 = 9.6;
const MAX_POST_OPS: usize = 4;

pub(super) fn register(builder: &mut PatternRegistryBuilder, backend: &str) -> Result<(), BuildError> {
    builder.register(
        "conv_bias_post_ops_fusion",
        backend,
        conv_with_post_ops(true)?,
        CONV_BIAS_POST_OPS_PRIORITY,
        PartitionCategory::ConvolutionPostOps,
        PatternAction::Fuse(fused_op_with_post_ops("conv_bias_post_ops")),
    )?;
    builder.register(
        "conv_post_ops_fusion",
        backend,
        conv_with_post_ops(false)?,
        CONV_POST_OPS_PRIORITY,
        PartitionCategory::ConvolutionPostOps,
        PatternAction::Fuse(fused_op_with_post_ops("conv_post_ops")),
    )?;
    Ok(())
}

fn conv_with_post_ops(with_bias: bool) -> Result<PatternGraph, BuildError> {
    let mut pattern = PatternGraphBuilder::new();
    let conv = pattern.append_op([OpKind::Convolution], [])?;
    let (tail, min) = if with_bias {
        let bias = pattern.append_op([OpKind::BiasAdd], [in_edge(0, conv, 0)])?;
        (bias, 0)
    } else {
        (conv, 1)
    };
    pattern.append_repetition(
        post_op()?,
        PortMap {
            output: 0,
            input: 0,
        },
        min,
        MAX_POST_OPS,
        [in_edge(0, tail, 0)],
    )?;
    pattern.finish()
}
