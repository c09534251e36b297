use crate::graph::OpKind;
use crate::pattern::{
    decisions, fused_op, fused_op_with_post_ops, in_edge, BuildError, PartitionCategory,
    PatternAction, PatternGraph, PatternGraphBuilder, PatternRegistryBuilder, PortMap,
};
use crate::passes::single;

const LAYERNORM_POST_OPS_PRIORITY: f32 = 8.5;
const REORDER_SUM_PRIORITY: f32 = 8.0;
const SINGLE_OP_PRIORITY: f32 = 1.0;

/// Kinds a backend can run on their own.
pub const SINGLE_OP_KINDS: &[OpKind] = &[
    OpKind::Abs,
    OpKind::Add,
    OpKind::AvgPool,
    OpKind::BatchNormInference,
    OpKind::BiasAdd,
    OpKind::Clamp,
    OpKind::Concat,
    OpKind::Convolution,
    OpKind::ConvTranspose,
    OpKind::Dequantize,
    OpKind::Divide,
    OpKind::DynamicDequantize,
    OpKind::DynamicQuantize,
    OpKind::Elu,
    OpKind::Exp,
    OpKind::Gelu,
    OpKind::HardSigmoid,
    OpKind::HardSwish,
    OpKind::Interpolate,
    OpKind::LayerNorm,
    OpKind::LeakyReLU,
    OpKind::Log,
    OpKind::LogSoftmax,
    OpKind::MatMul,
    OpKind::Maximum,
    OpKind::MaxPool,
    OpKind::Minimum,
    OpKind::Mish,
    OpKind::Multiply,
    OpKind::Pow,
    OpKind::PReLU,
    OpKind::Quantize,
    OpKind::ReduceMax,
    OpKind::ReduceMean,
    OpKind::ReduceMin,
    OpKind::ReduceSum,
    OpKind::ReLU,
    OpKind::Reorder,
    OpKind::Round,
    OpKind::Select,
    OpKind::Sigmoid,
    OpKind::SoftMax,
    OpKind::SoftPlus,
    OpKind::Sqrt,
    OpKind::Square,
    OpKind::StaticReshape,
    OpKind::StaticTranspose,
    OpKind::Subtract,
    OpKind::Tanh,
    OpKind::TypeCast,
];

pub(super) fn register(builder: &mut PatternRegistryBuilder, backend: &str) -> Result<(), BuildError> {
    builder.register(
        "layernorm_post_ops_fusion",
        backend,
        layernorm_post_ops()?,
        LAYERNORM_POST_OPS_PRIORITY,
        PartitionCategory::NormPostOps,
        PatternAction::Fuse(fused_op_with_post_ops("layernorm_post_ops")),
    )?;
    builder.register(
        "reorder_sum_fusion",
        backend,
        reorder_sum()?,
        REORDER_SUM_PRIORITY,
        PartitionCategory::ReorderPostOps,
        PatternAction::Fuse(fused_op("reorder_sum")),
    )?;
    builder.register(
        "single_op_partition",
        backend,
        PatternGraph::single_op(SINGLE_OP_KINDS.iter().copied())?,
        SINGLE_OP_PRIORITY,
        PartitionCategory::SingleOp,
        PatternAction::Partition,
    )?;
    Ok(())
}

/// LayerNorm followed by up to three of TypeCast, Quantize or a unary eltwise op.
fn layernorm_post_ops() -> Result<PatternGraph, BuildError> {
    let mut kinds = vec![OpKind::TypeCast, OpKind::Quantize];
    kinds.extend_from_slice(OpKind::ELTWISE_UNARY);

    let mut pattern = PatternGraphBuilder::new();
    let norm = pattern.append_op([OpKind::LayerNorm], [])?;
    pattern.append_repetition(
        single(&kinds)?,
        PortMap {
            output: 0,
            input: 0,
        },
        1,
        3,
        [in_edge(0, norm, 0)],
    )?;
    pattern.finish()
}

/// Reorder whose result is summed with another tensor.
fn reorder_sum() -> Result<PatternGraph, BuildError> {
    let mut pattern = PatternGraphBuilder::new();
    let reorder = pattern.append_op([OpKind::Reorder], [])?;
    pattern.append_decision_function(reorder, decisions::output_consumers_at_most(0, 1))?;
    pattern.append_op([OpKind::Add], [in_edge(0, reorder, 0)])?;
    pattern.finish()
}
