use std::collections::HashSet;

use fuse_rs::fusion::{FusionConfig, FusionManager, Partition};
use fuse_rs::graph::{DType, Graph, GraphBuilder, OpId, OpKind, TensorId};
use fuse_rs::passes::register_standard_patterns;
use fuse_rs::pattern::PatternRegistry;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SHAPE: [i64; 2] = [4, 4];

const UNARY: &[OpKind] = &[
    OpKind::ReLU,
    OpKind::Tanh,
    OpKind::Exp,
    OpKind::Sigmoid,
    OpKind::Reorder,
    OpKind::LayerNorm,
    OpKind::TypeCast,
];

const BINARY: &[OpKind] = &[
    OpKind::Add,
    OpKind::Multiply,
    OpKind::Maximum,
    OpKind::Subtract,
    OpKind::MatMul,
];

/// One generated op: kind selector plus two operand selectors.
type OpSeed = (u8, u16, u16);

fn build_graph(seeds: &[OpSeed]) -> Graph {
    let mut g = GraphBuilder::new();
    let mut values: Vec<TensorId> = (0..2)
        .map(|_| g.input(DType::F32, SHAPE).expect("input"))
        .collect();
    for (kind, a, b) in seeds {
        let pick = |selector: u16| values[selector as usize % values.len()];
        let kind = *kind as usize % (UNARY.len() + BINARY.len());
        let output = if kind < UNARY.len() {
            g.op(UNARY[kind], &[pick(*a)], DType::F32, SHAPE)
        } else {
            g.op(BINARY[kind - UNARY.len()], &[pick(*a), pick(*b)], DType::F32, SHAPE)
        }
        .expect("op");
        values.push(output);
    }
    g.finish()
}

fn manager(config: FusionConfig) -> FusionManager {
    let mut builder = PatternRegistry::builder();
    register_standard_patterns(&mut builder, "cpu").expect("patterns");
    FusionManager::new(&builder.freeze(), &["cpu"], config)
}

fn check_cover(graph: &Graph, partitions: &[Partition]) -> Result<(), TestCaseError> {
    let mut seen: HashSet<OpId> = HashSet::new();
    for (index, partition) in partitions.iter().enumerate() {
        prop_assert_eq!(partition.id().0, index as u64);
        prop_assert!(!partition.is_empty());
        for op in partition.op_ids() {
            prop_assert!(seen.insert(op), "{} claimed twice", op);
        }
    }
    prop_assert_eq!(seen.len(), graph.len());
    Ok(())
}

/// Every op of `graph` reads tensors that are graph inputs or produced earlier.
fn check_topological(graph: &Graph) -> Result<(), TestCaseError> {
    for (position, op) in graph.ops().iter().enumerate() {
        for input in &op.inputs {
            if let Some(producer) = graph.producer(*input) {
                let produced_at = graph.position(producer).expect("producer position");
                prop_assert!(produced_at < position, "{} read before it is produced", input);
            }
        }
    }
    Ok(())
}

fn op_seeds() -> impl Strategy<Value = Vec<OpSeed>> {
    prop::collection::vec((any::<u8>(), any::<u16>(), any::<u16>()), 1..24)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn partitions_cover_every_op_once(seeds in op_seeds()) {
        let graph = build_graph(&seeds);
        let outcome = manager(FusionConfig::default()).rewrite(&graph);
        check_cover(&graph, &outcome.partitions)?;
        check_topological(&outcome.graph)?;

        let fused_members: usize = outcome
            .partitions
            .iter()
            .filter(|partition| partition.fused_op().is_some())
            .map(Partition::len)
            .sum();
        prop_assert_eq!(
            outcome.graph.len(),
            graph.len() - fused_members + outcome.stats.fused_ops
        );
    }

    #[test]
    fn partitioning_is_deterministic(seeds in op_seeds()) {
        let graph = build_graph(&seeds);
        let fusion = manager(FusionConfig::default());
        let first = fusion.rewrite(&graph);
        let second = fusion.rewrite(&graph);
        prop_assert_eq!(first.partitions, second.partitions);
        prop_assert_eq!(first.graph.ops(), second.graph.ops());
    }

    #[test]
    fn partition_boundaries_are_consistent(seeds in op_seeds()) {
        let graph = build_graph(&seeds);
        for partition in manager(FusionConfig::default()).apply_patterns(&graph) {
            let members: HashSet<OpId> = partition.op_ids().into_iter().collect();
            for input in partition.inputs() {
                let internal = graph
                    .producer(input.id)
                    .is_some_and(|producer| members.contains(&producer));
                prop_assert!(!internal, "{} is produced inside {}", input.id, partition.id());
            }
            for output in partition.outputs() {
                let producer = graph.producer(output.id).expect("output producer");
                prop_assert!(members.contains(&producer));
            }
        }
    }
}

#[test]
fn memoized_plans_match_fresh_matching() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let fresh = manager(FusionConfig::default());
    let memo = manager(FusionConfig {
        plan_cache_capacity: 8,
        ..FusionConfig::default()
    });
    for _ in 0..64 {
        let len = rng.gen_range(1..16);
        let seeds: Vec<OpSeed> = (0..len).map(|_| rng.gen()).collect();
        let graph = build_graph(&seeds);
        let expected = fresh.rewrite(&graph);
        // Second call replays the memoized plan.
        memo.rewrite(&graph);
        let replayed = memo.rewrite(&graph);
        assert!(replayed.stats.plan_cache_hit);
        assert_eq!(replayed.partitions, expected.partitions);
        assert_eq!(replayed.graph.ops(), expected.graph.ops());
    }
    assert!(memo.cached_plans() <= 8);
}
