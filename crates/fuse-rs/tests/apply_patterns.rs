use std::collections::HashSet;
use std::sync::Arc;

use fuse_rs::fusion::{dump_partitions, FusionConfig, FusionManager, Partition, PartitionId};
use fuse_rs::graph::{
    AttrValue, DType, Graph, GraphBuilder, LogicalTensor, Op, OpId, OpKind, TensorId,
    FUSED_OPS_ATTR,
};
use fuse_rs::passes::register_standard_patterns;
use fuse_rs::pattern::{
    fused_op, PartitionCategory, PatternAction, PatternGraph, PatternRegistry,
};

const SHAPE: [i64; 2] = [2, 16];
const BACKEND: &str = "cpu";

fn standard_registry() -> PatternRegistry {
    let mut builder = PatternRegistry::builder();
    register_standard_patterns(&mut builder, BACKEND).expect("standard patterns");
    builder.freeze()
}

fn manager(config: FusionConfig) -> FusionManager {
    FusionManager::new(&standard_registry(), &[BACKEND], config)
}

fn kinds(partition: &Partition) -> Vec<OpKind> {
    partition.ops().iter().map(|op| op.kind).collect()
}

fn strs(values: &[&str]) -> AttrValue {
    AttrValue::Strs(values.iter().map(|value| value.to_string()).collect())
}

fn assert_exact_cover(graph: &Graph, partitions: &[Partition]) {
    let mut seen: HashSet<OpId> = HashSet::new();
    for partition in partitions {
        assert!(!partition.is_empty(), "{} is empty", partition.id());
        for op in partition.op_ids() {
            assert!(seen.insert(op), "{op} appears in two partitions");
        }
    }
    let all: HashSet<OpId> = graph.ops().iter().map(|op| op.id).collect();
    assert_eq!(seen, all);
}

#[test]
fn relu_add_multiply_fuses_into_one_eltwise_partition() {
    let mut g = GraphBuilder::new();
    let x = g.input(DType::F32, SHAPE).expect("x");
    let y = g.input(DType::F32, SHAPE).expect("y");
    let z = g.input(DType::F32, SHAPE).expect("z");
    let relu = g.op(OpKind::ReLU, &[x], DType::F32, SHAPE).expect("relu");
    let add = g.op(OpKind::Add, &[relu, y], DType::F32, SHAPE).expect("add");
    let out = g.op(OpKind::Multiply, &[add, z], DType::F32, SHAPE).expect("mul");
    let graph = g.finish();

    let outcome = manager(FusionConfig::default()).rewrite(&graph);
    assert_eq!(outcome.partitions.len(), 1);
    let partition = &outcome.partitions[0];
    assert_eq!(partition.id(), PartitionId(0));
    assert!(partition.is_supported());
    assert_eq!(partition.backend(), Some(BACKEND));
    assert_eq!(partition.pattern_name(), Some("eltwise_binary_fusion"));
    assert_eq!(partition.category(), Some(PartitionCategory::EltwisePostOps));
    assert_eq!(partition.fused_kind(), Some("eltwise_binary"));
    assert_eq!(kinds(partition), [OpKind::ReLU, OpKind::Add, OpKind::Multiply]);
    let inputs: Vec<TensorId> = partition.inputs().iter().map(|t| t.id).collect();
    let outputs: Vec<TensorId> = partition.outputs().iter().map(|t| t.id).collect();
    assert_eq!(inputs, [x, y, z]);
    assert_eq!(outputs, [out]);

    let fused = &outcome.graph.ops()[0];
    assert_eq!(outcome.graph.len(), 1);
    assert_eq!(fused.kind, OpKind::FusedOp);
    assert_eq!(fused.fused_kind(), Some("eltwise_binary"));
    assert_eq!(fused.inputs, [x, y, z]);
    assert_eq!(fused.outputs, [out]);
    assert_eq!(fused.attr(FUSED_OPS_ATTR), Some(&strs(&["ReLU", "Add", "Multiply"])));
    assert_eq!(fused.attr("post_ops"), Some(&strs(&["Add", "Multiply"])));
    assert!(outcome.graph.tensor(relu).is_none(), "internal tensor survived");
    assert_eq!(partition.fused_op(), Some(fused));

    assert_eq!(outcome.stats.matches, 1);
    assert_eq!(outcome.stats.fused_ops, 1);
    assert_eq!(outcome.stats.singletons, 0);
    assert_eq!(outcome.stats.rounds, 2);
}

#[test]
fn dequantize_relu_quantize_becomes_int8_relu() {
    let mut g = GraphBuilder::new();
    let q = g.input(DType::U8, SHAPE).expect("q");
    let dq = g.op(OpKind::Dequantize, &[q], DType::F32, SHAPE).expect("dq");
    let relu = g.op(OpKind::ReLU, &[dq], DType::F32, SHAPE).expect("relu");
    g.op(OpKind::Quantize, &[relu], DType::U8, SHAPE).expect("quant");
    let graph = g.finish();

    let partitions = manager(FusionConfig::default()).apply_patterns(&graph);
    assert_eq!(partitions.len(), 1);
    assert_eq!(partitions[0].pattern_name(), Some("int8_relu_fusion"));
    assert_eq!(partitions[0].fused_kind(), Some("int8_relu"));
    assert_eq!(
        kinds(&partitions[0]),
        [OpKind::Dequantize, OpKind::ReLU, OpKind::Quantize]
    );
}

#[test]
fn float_dequantize_is_not_an_int8_pattern() {
    let mut g = GraphBuilder::new();
    let f = g.input(DType::F32, SHAPE).expect("f");
    let dq = g.op(OpKind::Dequantize, &[f], DType::F32, SHAPE).expect("dq");
    let relu = g.op(OpKind::ReLU, &[dq], DType::F32, SHAPE).expect("relu");
    g.op(OpKind::Quantize, &[relu], DType::S8, SHAPE).expect("quant");
    let graph = g.finish();

    let partitions = manager(FusionConfig::default()).apply_patterns(&graph);
    assert!(partitions
        .iter()
        .all(|p| p.pattern_name() != Some("int8_relu_fusion")));
    assert_exact_cover(&graph, &partitions);
}

#[test]
fn int8_convolution_absorbs_bias_and_activation() {
    let mut g = GraphBuilder::new();
    let data = g.input(DType::S8, [1, 3, 8, 8]).expect("data");
    let weights = g.input(DType::S8, [4, 3, 3, 3]).expect("weights");
    let bias = g.input(DType::F32, [4]).expect("bias");
    let dq_data = g
        .op(OpKind::Dequantize, &[data], DType::F32, [1, 3, 8, 8])
        .expect("dq data");
    let dq_weights = g
        .op(OpKind::Dequantize, &[weights], DType::F32, [4, 3, 3, 3])
        .expect("dq weights");
    let conv = g
        .op(OpKind::Convolution, &[dq_data, dq_weights], DType::F32, [1, 4, 6, 6])
        .expect("conv");
    let biased = g
        .op(OpKind::BiasAdd, &[conv, bias], DType::F32, [1, 4, 6, 6])
        .expect("bias add");
    let relu = g
        .op(OpKind::ReLU, &[biased], DType::F32, [1, 4, 6, 6])
        .expect("relu");
    g.op(OpKind::Quantize, &[relu], DType::S8, [1, 4, 6, 6])
        .expect("quant");
    let graph = g.finish();

    let partitions = manager(FusionConfig::default()).apply_patterns(&graph);
    assert_eq!(partitions.len(), 1);
    assert_eq!(partitions[0].pattern_name(), Some("int8_conv_fusion"));
    assert_eq!(partitions[0].len(), 6);
    let inputs: Vec<TensorId> = partitions[0].inputs().iter().map(|t| t.id).collect();
    assert_eq!(inputs, [data, weights, bias]);
}

#[test]
fn conv_bias_post_ops_outrank_plain_conv_post_ops() {
    let mut g = GraphBuilder::new();
    let x = g.input(DType::F32, [1, 3, 8, 8]).expect("x");
    let w = g.input(DType::F32, [4, 3, 3, 3]).expect("w");
    let b = g.input(DType::F32, [4]).expect("b");
    let conv = g
        .op(OpKind::Convolution, &[x, w], DType::F32, [1, 4, 6, 6])
        .expect("conv");
    let biased = g
        .op(OpKind::BiasAdd, &[conv, b], DType::F32, [1, 4, 6, 6])
        .expect("bias");
    g.op(OpKind::ReLU, &[biased], DType::F32, [1, 4, 6, 6])
        .expect("relu");
    let graph = g.finish();

    let outcome = manager(FusionConfig::default()).rewrite(&graph);
    assert_eq!(outcome.partitions.len(), 1);
    let partition = &outcome.partitions[0];
    assert_eq!(partition.pattern_name(), Some("conv_bias_post_ops_fusion"));
    let fused = partition.fused_op().expect("fused node");
    assert_eq!(fused.attr("post_ops"), Some(&strs(&["BiasAdd", "ReLU"])));
}

#[test]
fn matmul_post_ops_chain_stops_at_four() {
    let mut g = GraphBuilder::new();
    let a = g.input(DType::F32, [8, 16]).expect("a");
    let b = g.input(DType::F32, [16, 32]).expect("b");
    let bias = g.input(DType::F32, [32]).expect("bias");
    let mut t = g.op(OpKind::MatMul, &[a, b], DType::F32, [8, 32]).expect("matmul");
    t = g.op(OpKind::BiasAdd, &[t, bias], DType::F32, [8, 32]).expect("bias");
    t = g.op(OpKind::Gelu, &[t], DType::F32, [8, 32]).expect("gelu");
    t = g.op(OpKind::Tanh, &[t], DType::F32, [8, 32]).expect("tanh");
    t = g.op(OpKind::Sigmoid, &[t], DType::F32, [8, 32]).expect("sigmoid");
    g.op(OpKind::Exp, &[t], DType::F32, [8, 32]).expect("exp");
    let graph = g.finish();

    let partitions = manager(FusionConfig::default()).apply_patterns(&graph);
    assert_eq!(partitions.len(), 2);
    assert_eq!(partitions[0].pattern_name(), Some("matmul_post_ops_fusion"));
    assert_eq!(partitions[0].len(), 5);
    assert_eq!(partitions[1].pattern_name(), Some("single_op_partition"));
    assert_eq!(kinds(&partitions[1]), [OpKind::Exp]);
    assert_exact_cover(&graph, &partitions);
}

#[test]
fn reorder_sum_requires_a_single_consumer() {
    let build = |extra_consumer: bool| {
        let mut g = GraphBuilder::new();
        let x = g.input(DType::F32, SHAPE).expect("x");
        let y = g.input(DType::F32, SHAPE).expect("y");
        let reordered = g.op(OpKind::Reorder, &[x], DType::F32, SHAPE).expect("reorder");
        g.op(OpKind::Add, &[reordered, y], DType::F32, SHAPE).expect("add");
        if extra_consumer {
            g.op(OpKind::Abs, &[reordered], DType::F32, SHAPE).expect("abs");
        }
        g.finish()
    };
    let fusion = manager(FusionConfig::default());

    let fused = fusion.apply_patterns(&build(false));
    assert_eq!(fused.len(), 1);
    assert_eq!(fused[0].fused_kind(), Some("reorder_sum"));

    let graph = build(true);
    let split = fusion.apply_patterns(&graph);
    assert!(split.iter().all(|p| p.pattern_name() == Some("single_op_partition")));
    assert_eq!(split.len(), 3);
}

#[test]
fn equal_priorities_go_to_the_first_registered_pattern() {
    let relu = || Arc::new(PatternGraph::single_op([OpKind::ReLU]).expect("relu"));
    let mut builder = PatternRegistry::builder();
    builder
        .register("low", BACKEND, relu(), 1.0, PartitionCategory::Misc, PatternAction::Fuse(fused_op("low")))
        .expect("low");
    builder
        .register("first", BACKEND, relu(), 5.0, PartitionCategory::Misc, PatternAction::Fuse(fused_op("first")))
        .expect("first");
    builder
        .register("second", BACKEND, relu(), 5.0, PartitionCategory::Misc, PatternAction::Fuse(fused_op("second")))
        .expect("second");
    let registry = builder.freeze();

    let mut g = GraphBuilder::new();
    let x = g.input(DType::F32, SHAPE).expect("x");
    g.op(OpKind::ReLU, &[x], DType::F32, SHAPE).expect("relu");
    let graph = g.finish();

    let partitions = FusionManager::new(&registry, &[BACKEND], FusionConfig::default())
        .apply_patterns(&graph);
    assert_eq!(partitions.len(), 1);
    assert_eq!(partitions[0].pattern_name(), Some("first"));
    assert_eq!(partitions[0].fused_kind(), Some("first"));
}

fn mixed_graph() -> Graph {
    let mut g = GraphBuilder::new();
    let x = g.input(DType::F32, [1, 3, 8, 8]).expect("x");
    let w = g.input(DType::F32, [4, 3, 3, 3]).expect("w");
    let m = g.input(DType::F32, [6, 6]).expect("m");
    let conv = g
        .op(OpKind::Convolution, &[x, w], DType::F32, [1, 4, 6, 6])
        .expect("conv");
    let relu = g
        .op(OpKind::ReLU, &[conv], DType::F32, [1, 4, 6, 6])
        .expect("relu");
    let norm = g
        .op(OpKind::LayerNorm, &[relu], DType::F32, [1, 4, 6, 6])
        .expect("norm");
    let cast = g
        .op(OpKind::TypeCast, &[norm], DType::F16, [1, 4, 6, 6])
        .expect("cast");
    let mm = g
        .op(OpKind::MatMul, &[cast, m], DType::F16, [1, 4, 6, 6])
        .expect("matmul");
    let soft = g
        .op(OpKind::SoftMax, &[mm], DType::F16, [1, 4, 6, 6])
        .expect("softmax");
    g.op_multi(OpKind::End, &[soft], Vec::<(&str, AttrValue)>::new(), Vec::new())
        .expect("end");
    g.finish()
}

#[test]
fn every_op_lands_in_exactly_one_partition() {
    let graph = mixed_graph();
    let outcome = manager(FusionConfig::default()).rewrite(&graph);
    assert_exact_cover(&graph, &outcome.partitions);

    let ids: Vec<u64> = outcome.partitions.iter().map(|p| p.id().0).collect();
    let expected: Vec<u64> = (0..outcome.partitions.len() as u64).collect();
    assert_eq!(ids, expected);

    let first_positions: Vec<usize> = outcome
        .partitions
        .iter()
        .map(|p| {
            p.op_ids()
                .iter()
                .filter_map(|op| graph.position(*op))
                .min()
                .expect("member position")
        })
        .collect();
    assert!(first_positions.windows(2).all(|pair| pair[0] < pair[1]));

    let names: Vec<Option<&str>> = outcome.partitions.iter().map(|p| p.pattern_name()).collect();
    assert_eq!(
        names,
        [
            Some("conv_post_ops_fusion"),
            Some("layernorm_post_ops_fusion"),
            Some("single_op_partition"),
            Some("single_op_partition"),
            None,
        ]
    );
    let end = outcome.partitions.last().expect("end partition");
    assert!(!end.is_supported());
    assert_eq!(end.backend(), None);
    assert_eq!(outcome.stats.singletons, 1);
}

#[test]
fn zero_passes_leaves_only_unsupported_singletons() {
    let graph = mixed_graph();
    let config = FusionConfig {
        max_passes: 0,
        ..FusionConfig::default()
    };
    let outcome = manager(config).rewrite(&graph);
    assert_eq!(outcome.partitions.len(), graph.len());
    assert!(outcome.partitions.iter().all(|p| !p.is_supported() && p.len() == 1));
    assert_eq!(outcome.stats.rounds, 0);
    assert_eq!(outcome.stats.singletons, graph.len());
    assert_eq!(outcome.graph.ops(), graph.ops());
}

#[test]
fn backends_without_patterns_get_singletons() {
    let graph = mixed_graph();
    let partitions = FusionManager::new(&standard_registry(), &["gpu"], FusionConfig::default())
        .apply_patterns(&graph);
    assert_eq!(partitions.len(), graph.len());
    assert!(partitions.iter().all(|p| !p.is_supported()));
}

#[test]
fn disabled_patterns_are_skipped() {
    let mut g = GraphBuilder::new();
    let x = g.input(DType::F32, SHAPE).expect("x");
    let y = g.input(DType::F32, SHAPE).expect("y");
    let relu = g.op(OpKind::ReLU, &[x], DType::F32, SHAPE).expect("relu");
    let add = g.op(OpKind::Add, &[relu, y], DType::F32, SHAPE).expect("add");
    g.op(OpKind::Multiply, &[add, y], DType::F32, SHAPE).expect("mul");
    let graph = g.finish();

    let config = FusionConfig {
        disabled_patterns: vec!["eltwise_binary_fusion".to_string()],
        ..FusionConfig::default()
    };
    let fusion = manager(config);
    assert!(fusion
        .patterns()
        .iter()
        .all(|p| p.name() != "eltwise_binary_fusion"));
    let partitions = fusion.apply_patterns(&graph);
    assert_eq!(partitions.len(), 3);
    assert!(partitions.iter().all(|p| p.is_supported() && p.fused_op().is_none()));
}

#[test]
fn escaping_intermediates_stay_wired() {
    let mut g = GraphBuilder::new();
    let x = g.input(DType::F32, SHAPE).expect("x");
    let y = g.input(DType::F32, SHAPE).expect("y");
    let relu = g.op(OpKind::ReLU, &[x], DType::F32, SHAPE).expect("relu");
    let add = g.op(OpKind::Add, &[relu, y], DType::F32, SHAPE).expect("add");
    let mul = g.op(OpKind::Multiply, &[add, y], DType::F32, SHAPE).expect("mul");
    g.op_multi(OpKind::End, &[add], Vec::<(&str, AttrValue)>::new(), Vec::new())
        .expect("end");
    let graph = g.finish();

    let outcome = manager(FusionConfig::default()).rewrite(&graph);
    let fused = outcome
        .graph
        .ops()
        .iter()
        .find(|op| op.kind == OpKind::FusedOp)
        .expect("fused node");
    assert_eq!(fused.outputs, [add, mul]);
    let end = outcome
        .graph
        .ops()
        .iter()
        .find(|op| op.kind == OpKind::End)
        .expect("end op");
    assert_eq!(end.inputs, [add]);
    assert_eq!(outcome.graph.producer(add), Some(fused.id));
    assert!(outcome.graph.position(fused.id) < outcome.graph.position(end.id));
}

#[test]
fn rewriting_is_deterministic() {
    let graph = mixed_graph();
    let fusion = manager(FusionConfig::default());
    let first = fusion.rewrite(&graph);
    let second = fusion.rewrite(&graph);
    assert_eq!(first.partitions, second.partitions);
    assert_eq!(first.graph.ops(), second.graph.ops());
    assert_eq!(
        manager(FusionConfig::default()).apply_patterns(&graph),
        first.partitions
    );
}

/// relu -> add -> mul with every tensor and op id shifted by `offset`.
fn chain_with_offset(offset: u64) -> Graph {
    let t = |n: u64| TensorId(offset + n);
    let mut graph = Graph::new();
    for n in 0..6 {
        graph
            .add_tensor(LogicalTensor::strided(t(n), DType::F32, SHAPE))
            .expect("tensor");
    }
    let ops = [
        Op::new(OpId(offset), OpKind::ReLU)
            .with_inputs([t(0)])
            .with_outputs([t(3)]),
        Op::new(OpId(offset + 1), OpKind::Add)
            .with_inputs([t(3), t(1)])
            .with_outputs([t(4)]),
        Op::new(OpId(offset + 2), OpKind::Multiply)
            .with_inputs([t(4), t(2)])
            .with_outputs([t(5)]),
    ];
    for op in ops {
        graph.add_op(op).expect("op");
    }
    graph
}

#[test]
fn plan_memo_replays_structurally_identical_graphs() {
    let config = FusionConfig {
        plan_cache_capacity: 4,
        ..FusionConfig::default()
    };
    let fusion = manager(config);

    let original = chain_with_offset(0);
    let cold = fusion.rewrite(&original);
    assert!(!cold.stats.plan_cache_hit);
    assert_eq!(fusion.cached_plans(), 1);

    let warm = fusion.rewrite(&original);
    assert!(warm.stats.plan_cache_hit);
    assert_eq!(warm.partitions, cold.partitions);

    let shifted = chain_with_offset(100);
    let replayed = fusion.rewrite(&shifted);
    assert!(replayed.stats.plan_cache_hit);
    assert_eq!(fusion.cached_plans(), 1);
    assert_eq!(replayed.partitions.len(), 1);
    assert_eq!(
        replayed.partitions[0].op_ids(),
        [OpId(100), OpId(101), OpId(102)]
    );
    assert_eq!(replayed.partitions[0].fused_kind(), Some("eltwise_binary"));
}

#[test]
fn plan_memo_distinguishes_shapes() {
    let config = FusionConfig {
        plan_cache_capacity: 4,
        ..FusionConfig::default()
    };
    let fusion = manager(config);
    let build = |rows: i64| {
        let mut g = GraphBuilder::new();
        let x = g.input(DType::F32, [rows, 4]).expect("x");
        g.op(OpKind::Exp, &[x], DType::F32, [rows, 4]).expect("exp");
        g.finish()
    };
    fusion.rewrite(&build(2));
    let other = fusion.rewrite(&build(3));
    assert!(!other.stats.plan_cache_hit);
    assert_eq!(fusion.cached_plans(), 2);
}

#[test]
fn dump_lists_every_partition() {
    let graph = mixed_graph();
    let partitions = manager(FusionConfig::default()).apply_patterns(&graph);
    let dump = dump_partitions(&partitions);
    let entries = dump["partitions"].as_array().expect("array");
    assert_eq!(entries.len(), partitions.len());
    assert_eq!(entries[0]["pattern"], "conv_post_ops_fusion");
    assert_eq!(entries[0]["fused_kind"], "conv_post_ops");
    assert_eq!(entries[0]["supported"], true);
    let last = entries.last().expect("last");
    assert_eq!(last["supported"], false);
    assert!(last["backend"].is_null());
}
