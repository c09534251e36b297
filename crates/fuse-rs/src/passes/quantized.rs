use crate::graph::OpKind;
use crate::pattern::{
    decisions, fused_op, in_edge, BuildError, NodeId, PartitionCategory, PatternAction,
    PatternGraph, PatternGraphBuilder, PatternRegistryBuilder,
};
use crate::passes::{single, QUANTIZED};

const INT8_RELU_PRIORITY: f32 = 9.9;
const INT8_COMPUTE_PRIORITY: f32 = 9.8;

pub(super) fn register(builder: &mut PatternRegistryBuilder, backend: &str) -> Result<(), BuildError> {
    builder.register(
        "int8_relu_fusion",
        backend,
        int8_relu()?,
        INT8_RELU_PRIORITY,
        PartitionCategory::QuantizedEltwise,
        PatternAction::Fuse(fused_op("int8_relu")),
    )?;
    builder.register(
        "int8_conv_fusion",
        backend,
        int8_compute(OpKind::Convolution)?,
        INT8_COMPUTE_PRIORITY,
        PartitionCategory::QuantizedConvolution,
        PatternAction::Fuse(fused_op("int8_conv")),
    )?;
    builder.register(
        "int8_matmul_fusion",
        backend,
        int8_compute(OpKind::MatMul)?,
        INT8_COMPUTE_PRIORITY,
        PartitionCategory::QuantizedMatMul,
        PatternAction::Fuse(fused_op("int8_matmul")),
    )?;
    Ok(())
}

fn dequantize(pattern: &mut PatternGraphBuilder) -> Result<NodeId, BuildError> {
    let node = pattern.append_op([OpKind::Dequantize], [])?;
    pattern.append_decision_function(node, decisions::input_dtype_in(0, QUANTIZED))?;
    Ok(node)
}

fn quantize(pattern: &mut PatternGraphBuilder, producer: NodeId) -> Result<NodeId, BuildError> {
    let node = pattern.append_op([OpKind::Quantize], [in_edge(0, producer, 0)])?;
    pattern.append_decision_function(node, decisions::output_dtype_in(0, QUANTIZED))?;
    Ok(node)
}

/// Dequantize → ReLU → Quantize.
fn int8_relu() -> Result<PatternGraph, BuildError> {
    let mut pattern = PatternGraphBuilder::new();
    let dq = dequantize(&mut pattern)?;
    let relu = pattern.append_op([OpKind::ReLU], [in_edge(0, dq, 0)])?;
    quantize(&mut pattern, relu)?;
    pattern.finish()
}

/// Dequantized data and weights into `compute`, an optional bias and
/// activation, then Quantize.
fn int8_compute(compute: OpKind) -> Result<PatternGraph, BuildError> {
    let mut pattern = PatternGraphBuilder::new();
    let dq_data = dequantize(&mut pattern)?;
    let dq_weight = dequantize(&mut pattern)?;
    let op = pattern.append_op([compute], [in_edge(0, dq_data, 0), in_edge(1, dq_weight, 0)])?;
    let bias = pattern.append_optional(single(&[OpKind::BiasAdd])?, [in_edge(0, op, 0)])?;
    let activation = pattern.append_optional(
        single(&[OpKind::ReLU, OpKind::Gelu, OpKind::Sigmoid, OpKind::Tanh, OpKind::Clamp])?,
        [in_edge(0, bias, 0)],
    )?;
    quantize(&mut pattern, activation)?;
    pattern.finish()
}
