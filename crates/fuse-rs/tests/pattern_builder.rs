use std::sync::Arc;

use fuse_rs::graph::OpKind;
use fuse_rs::passes::register_standard_patterns;
use fuse_rs::pattern::{
    fused_op, in_edge, registry_from_registrars, BuildError, NodeId, PartitionCategory,
    PatternAction, PatternGraph, PatternGraphBuilder, PatternNode, PatternRegistrar,
    PatternRegistry, PatternRegistryBuilder, PortDirection, PortMap, Repetition,
};

fn single(kinds: &[OpKind]) -> Arc<PatternGraph> {
    Arc::new(PatternGraph::single_op(kinds.iter().copied()).expect("single op pattern"))
}

#[test]
fn chain_with_repetition_builds() {
    let mut builder = PatternGraphBuilder::new();
    let conv = builder.append_op([OpKind::Convolution], []).expect("conv");
    let bias = builder
        .append_optional(single(&[OpKind::BiasAdd]), [in_edge(0, conv, 0)])
        .expect("bias");
    builder
        .append_repetition(
            single(&[OpKind::ReLU, OpKind::Add]),
            PortMap { output: 0, input: 0 },
            1,
            Repetition::UNBOUNDED,
            [in_edge(0, bias, 0)],
        )
        .expect("post ops");
    builder.create_input_port(0, conv, 0).expect("input port");
    let pattern = builder.finish().expect("finish");

    assert_eq!(pattern.nodes().len(), 3);
    assert_eq!(pattern.anchor(), NodeId(0));
    assert_eq!(pattern.edges().len(), 2);
    assert_eq!(pattern.in_edges(NodeId(2)).count(), 1);
    assert_eq!(pattern.out_edges(NodeId(0)).count(), 1);
    assert_eq!(pattern.inputs().len(), 1);
    // Conv plus at least one post-op; the optional bias may vanish.
    assert_eq!(pattern.min_ops(), 2);
    match &pattern.nodes()[1] {
        PatternNode::Repetition(rep) => assert!(rep.is_optional()),
        other => panic!("expected repetition, got {other:?}"),
    }
}

#[test]
fn empty_kind_set_is_rejected() {
    let mut builder = PatternGraphBuilder::new();
    let err = builder.append_op([], []).unwrap_err();
    assert_eq!(err, BuildError::EmptyKindSet);
}

#[test]
fn empty_alternation_is_rejected() {
    let mut builder = PatternGraphBuilder::new();
    let err = builder.append_alternation(Vec::new(), []).unwrap_err();
    assert_eq!(err, BuildError::EmptyAlternation);
}

#[test]
fn repetition_bounds_are_validated() {
    let mut builder = PatternGraphBuilder::new();
    let head = builder.append_op([OpKind::ReLU], []).expect("head");
    let chain = PortMap { output: 0, input: 0 };

    let err = builder
        .append_repetition(single(&[OpKind::Add]), chain, 0, 0, [in_edge(0, head, 0)])
        .unwrap_err();
    assert_eq!(err, BuildError::InvalidRepetitionBounds { min: 0, max: 0 });

    let err = builder
        .append_repetition(single(&[OpKind::Add]), chain, 3, 2, [in_edge(0, head, 0)])
        .unwrap_err();
    assert_eq!(err, BuildError::InvalidRepetitionBounds { min: 3, max: 2 });
}

#[test]
fn repetition_port_map_must_exist_in_body() {
    let mut builder = PatternGraphBuilder::new();
    let head = builder.append_op([OpKind::ReLU], []).expect("head");
    let err = builder
        .append_repetition(
            single(&[OpKind::Add]),
            PortMap { output: 1, input: 0 },
            1,
            2,
            [in_edge(0, head, 0)],
        )
        .unwrap_err();
    assert_eq!(
        err,
        BuildError::MissingSubgraphPort {
            direction: PortDirection::Output,
            port: 1,
        }
    );
}

#[test]
fn edges_must_reference_existing_nodes() {
    let mut builder = PatternGraphBuilder::new();
    let err = builder
        .append_op([OpKind::ReLU], [in_edge(0, NodeId(4), 0)])
        .unwrap_err();
    assert_eq!(err, BuildError::UnknownNode(NodeId(4)));
}

#[test]
fn one_edge_per_input_port() {
    let mut builder = PatternGraphBuilder::new();
    let a = builder.append_op([OpKind::ReLU], []).expect("a");
    let b = builder.append_op([OpKind::Tanh], [in_edge(0, a, 0)]).expect("b");
    let err = builder
        .append_op([OpKind::Add], [in_edge(0, a, 0), in_edge(0, b, 0)])
        .unwrap_err();
    assert_eq!(
        err,
        BuildError::DuplicateInEdge {
            node: NodeId(2),
            port: 0,
        }
    );
}

#[test]
fn ports_must_be_dense_and_bound_once() {
    let mut builder = PatternGraphBuilder::new();
    let op = builder.append_op([OpKind::Add], []).expect("op");
    builder.create_input_port(0, op, 0).expect("port 0");
    let err = builder.create_input_port(0, op, 1).unwrap_err();
    assert_eq!(
        err,
        BuildError::PortAlreadyBound {
            direction: PortDirection::Input,
            index: 0,
        }
    );
    builder.create_input_port(2, op, 1).expect("port 2");
    let err = builder.finish().unwrap_err();
    assert_eq!(
        err,
        BuildError::UnboundPort {
            direction: PortDirection::Input,
            index: 1,
        }
    );
}

#[test]
fn disconnected_nodes_are_rejected() {
    let mut builder = PatternGraphBuilder::new();
    builder.append_op([OpKind::ReLU], []).expect("a");
    builder.append_op([OpKind::Tanh], []).expect("b");
    assert_eq!(builder.finish().unwrap_err(), BuildError::Disconnected(NodeId(1)));
}

#[test]
fn empty_pattern_is_rejected() {
    assert_eq!(
        PatternGraphBuilder::new().finish().unwrap_err(),
        BuildError::EmptyPattern
    );
}

#[test]
fn decisions_only_attach_to_op_nodes() {
    let mut builder = PatternGraphBuilder::new();
    let alt = builder
        .append_alternation_ops(vec![vec![OpKind::ReLU], vec![OpKind::Tanh]], [])
        .expect("alternation");
    let err = builder
        .append_decision_function(alt, |_view| true)
        .unwrap_err();
    assert_eq!(err, BuildError::DecisionOnCompositeNode(alt));
    assert_eq!(
        builder
            .append_decision_function(NodeId(9), |_view| true)
            .unwrap_err(),
        BuildError::UnknownNode(NodeId(9))
    );
}

fn trivial_pattern() -> Arc<PatternGraph> {
    single(&[OpKind::ReLU])
}

#[test]
fn registry_orders_by_priority_then_registration() {
    let mut builder = PatternRegistry::builder();
    for (name, priority) in [("low", 1.0), ("first_high", 5.0), ("second_high", 5.0), ("mid", 3.0)] {
        builder
            .register(
                name,
                "cpu",
                trivial_pattern(),
                priority,
                PartitionCategory::Misc,
                PatternAction::Fuse(fused_op("relu")),
            )
            .expect("register");
    }
    let registry = builder.freeze();
    let names: Vec<&str> = registry.iter().map(|pattern| pattern.name()).collect();
    assert_eq!(names, ["first_high", "second_high", "mid", "low"]);
}

#[test]
fn registry_rejects_bad_registrations() {
    let mut builder = PatternRegistryBuilder::new();
    let register = |builder: &mut PatternRegistryBuilder, name: &str, priority: f32| {
        builder
            .register(
                name,
                "cpu",
                trivial_pattern(),
                priority,
                PartitionCategory::Misc,
                PatternAction::Partition,
            )
            .map(|_| ())
    };
    assert_eq!(register(&mut builder, "", 1.0), Err(BuildError::EmptyName));
    assert_eq!(
        register(&mut builder, "nan", f32::NAN),
        Err(BuildError::InvalidPriority {
            name: "nan".to_string()
        })
    );
    register(&mut builder, "relu", 1.0).expect("first");
    assert_eq!(
        register(&mut builder, "relu", 2.0),
        Err(BuildError::DuplicatePattern {
            name: "relu".to_string(),
            backend: "cpu".to_string(),
        })
    );
    // Same name under another backend is a different pattern.
    builder
        .register(
            "relu",
            "gpu",
            trivial_pattern(),
            1.0,
            PartitionCategory::Misc,
            PatternAction::Partition,
        )
        .expect("other backend");
    assert_eq!(builder.len(), 2);
}

#[test]
fn patterns_for_filters_backends() {
    let mut builder = PatternRegistry::builder();
    register_standard_patterns(&mut builder, "cpu").expect("cpu patterns");
    builder
        .register(
            "gpu_only",
            "gpu",
            trivial_pattern(),
            100.0,
            PartitionCategory::Misc,
            PatternAction::Partition,
        )
        .expect("gpu pattern");
    let registry = builder.freeze();

    let cpu = registry.patterns_for(&["cpu"]);
    assert!(cpu.iter().all(|pattern| pattern.backend() == "cpu"));
    assert_eq!(cpu.first().map(|p| p.name()), Some("int8_relu_fusion"));
    assert_eq!(cpu.last().map(|p| p.name()), Some("single_op_partition"));
    assert!(cpu
        .windows(2)
        .all(|pair| pair[0].priority() >= pair[1].priority()));

    let both = registry.patterns_for(&["cpu", "gpu"]);
    assert_eq!(both.len(), cpu.len() + 1);
    assert_eq!(both[0].name(), "gpu_only");
    assert_eq!(registry.backends(), vec!["cpu", "gpu"]);
    assert!(registry.get("conv_post_ops_fusion", "cpu").is_some());
    assert!(registry.get("conv_post_ops_fusion", "gpu").is_none());
}

fn register_a(builder: &mut PatternRegistryBuilder) -> Result<(), BuildError> {
    builder.register(
        "a_pattern",
        "x",
        trivial_pattern(),
        1.0,
        PartitionCategory::Misc,
        PatternAction::Partition,
    )?;
    Ok(())
}

fn register_b(builder: &mut PatternRegistryBuilder) -> Result<(), BuildError> {
    builder.register(
        "b_pattern",
        "x",
        trivial_pattern(),
        1.0,
        PartitionCategory::Misc,
        PatternAction::Partition,
    )?;
    Ok(())
}

#[test]
fn registrars_run_in_name_order() {
    let registrars = [
        PatternRegistrar {
            name: "zeta",
            register: register_a,
        },
        PatternRegistrar {
            name: "alpha",
            register: register_b,
        },
    ];
    let registry = registry_from_registrars(&registrars).expect("registry");
    let names: Vec<&str> = registry.iter().map(|pattern| pattern.name()).collect();
    assert_eq!(names, ["b_pattern", "a_pattern"]);
}

#[test]
fn failing_registrar_surfaces_its_error() {
    let registrars = [
        PatternRegistrar {
            name: "one",
            register: register_a,
        },
        PatternRegistrar {
            name: "two",
            register: register_a,
        },
    ];
    let err = registry_from_registrars(&registrars).unwrap_err();
    assert_eq!(
        err,
        BuildError::DuplicatePattern {
            name: "a_pattern".to_string(),
            backend: "x".to_string(),
        }
    );
}
