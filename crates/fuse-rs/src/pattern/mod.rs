//! Declarative pattern graphs: op matchers, alternations and repetitions
//! wired together through explicit ports.

pub mod builder;
pub mod decisions;
pub mod registry;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::graph::{OpKind, OpView};

pub use builder::{in_edge, InEdge, PatternGraphBuilder};
pub use registry::{
    default_registry, fused_op, fused_op_with_post_ops, registry_from_registrars, FusedOpFactory,
    FusedOpSpec, FusionContext, PartitionCategory, PatternAction, PatternRegistrar,
    PatternRegistry, PatternRegistryBuilder, RegisteredPattern, PATTERN_REGISTRARS,
};

/// Index of a node within one pattern graph. Node 0 is the anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortDirection {
    Input,
    Output,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortDirection::Input => f.write_str("input"),
            PortDirection::Output => f.write_str("output"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("op matcher needs at least one kind")]
    EmptyKindSet,
    #[error("alternation needs at least one branch")]
    EmptyAlternation,
    #[error("invalid repetition bounds [{min}, {max}]")]
    InvalidRepetitionBounds { min: usize, max: usize },
    #[error("unknown pattern node {0}")]
    UnknownNode(NodeId),
    #[error("{direction} port {index} is already bound")]
    PortAlreadyBound {
        direction: PortDirection,
        index: usize,
    },
    #[error("{direction} ports must be dense; port {index} is unbound")]
    UnboundPort {
        direction: PortDirection,
        index: usize,
    },
    #[error("input port {port} of node {node} already has an incoming edge")]
    DuplicateInEdge { node: NodeId, port: usize },
    #[error("sub-pattern exposes no {direction} port {port}")]
    MissingSubgraphPort {
        direction: PortDirection,
        port: usize,
    },
    #[error("decision functions attach to op nodes only; {0} is composite")]
    DecisionOnCompositeNode(NodeId),
    #[error("pattern graph has no nodes")]
    EmptyPattern,
    #[error("node {0} is not connected to the anchor")]
    Disconnected(NodeId),
    #[error("pattern name must not be empty")]
    EmptyName,
    #[error("pattern {name} is already registered for backend {backend}")]
    DuplicatePattern { name: String, backend: String },
    #[error("pattern {name} has a non-finite priority")]
    InvalidPriority { name: String },
}

/// Predicate evaluated against a candidate op after its kind matched.
pub type Decision = Arc<dyn Fn(&OpView<'_>) -> bool + Send + Sync>;

/// Matches one concrete op: its kind must be in the set and every decision must hold.
#[derive(Clone)]
pub struct OpMatcher {
    kinds: Vec<OpKind>,
    decisions: Vec<Decision>,
}

impl OpMatcher {
    pub(crate) fn new(kinds: Vec<OpKind>) -> Self {
        OpMatcher {
            kinds,
            decisions: Vec::new(),
        }
    }

    pub(crate) fn push_decision(&mut self, decision: Decision) {
        self.decisions.push(decision);
    }

    pub fn kinds(&self) -> &[OpKind] {
        &self.kinds
    }

    pub fn decision_count(&self) -> usize {
        self.decisions.len()
    }

    pub fn accepts_kind(&self, kind: OpKind) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn accepts(&self, view: &OpView<'_>) -> bool {
        self.accepts_kind(view.kind()) && self.decisions.iter().all(|decision| decision(view))
    }
}

impl fmt::Debug for OpMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpMatcher")
            .field("kinds", &self.kinds)
            .field("decisions", &self.decisions.len())
            .finish()
    }
}

/// Which sub-pattern output feeds which sub-pattern input between repetition instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMap {
    pub output: usize,
    pub input: usize,
}

#[derive(Debug, Clone)]
pub struct Repetition {
    pub body: Arc<PatternGraph>,
    pub port_map: PortMap,
    pub min: usize,
    pub max: usize,
}

impl Repetition {
    /// Upper bound meaning "as many instances as match".
    pub const UNBOUNDED: usize = usize::MAX;

    pub fn is_optional(&self) -> bool {
        self.min == 0 && self.max == 1
    }
}

#[derive(Debug, Clone)]
pub enum PatternNode {
    Op(OpMatcher),
    /// Ordered branches; the first branch that matches is taken.
    Alternation(Vec<Arc<PatternGraph>>),
    Repetition(Repetition),
}

impl PatternNode {
    pub fn is_composite(&self) -> bool {
        !matches!(self, PatternNode::Op(_))
    }

    /// Whether a composite node's sub-patterns all expose the given port.
    fn exposes(&self, direction: PortDirection, port: usize) -> bool {
        match self {
            PatternNode::Op(_) => true,
            PatternNode::Alternation(branches) => branches
                .iter()
                .all(|branch| branch.port(direction, port).is_some()),
            PatternNode::Repetition(rep) => rep.body.port(direction, port).is_some(),
        }
    }
}

/// One end of a port binding: `port` of node `node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub node: NodeId,
    pub port: usize,
}

/// Data edge from an output port of `producer` to an input port of `consumer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatternEdge {
    pub producer: NodeId,
    pub producer_port: usize,
    pub consumer: NodeId,
    pub consumer_port: usize,
}

/// Immutable pattern graph produced by [`PatternGraphBuilder::finish`].
#[derive(Debug, Clone)]
pub struct PatternGraph {
    nodes: Vec<PatternNode>,
    edges: Vec<PatternEdge>,
    in_edges: Vec<Vec<usize>>,
    out_edges: Vec<Vec<usize>>,
    inputs: Vec<PortRef>,
    outputs: Vec<PortRef>,
}

impl PatternGraph {
    /// One-op pattern exposing input ports 0 and 1 and output port 0.
    pub fn single_op(kinds: impl IntoIterator<Item = OpKind>) -> Result<PatternGraph, BuildError> {
        let mut builder = PatternGraphBuilder::new();
        let op = builder.append_op(kinds, [])?;
        builder.create_input_port(0, op, 0)?;
        builder.create_input_port(1, op, 1)?;
        builder.create_output_port(0, op, 0)?;
        builder.finish()
    }

    pub fn anchor(&self) -> NodeId {
        NodeId(0)
    }

    pub fn nodes(&self) -> &[PatternNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&PatternNode> {
        self.nodes.get(id.index())
    }

    pub fn edges(&self) -> &[PatternEdge] {
        &self.edges
    }

    /// Edges into `node`, by consumer port order of insertion.
    pub fn in_edges(&self, node: NodeId) -> impl Iterator<Item = &PatternEdge> + '_ {
        self.in_edges
            .get(node.index())
            .into_iter()
            .flatten()
            .map(move |edge| &self.edges[*edge])
    }

    pub fn out_edges(&self, node: NodeId) -> impl Iterator<Item = &PatternEdge> + '_ {
        self.out_edges
            .get(node.index())
            .into_iter()
            .flatten()
            .map(move |edge| &self.edges[*edge])
    }

    pub fn inputs(&self) -> &[PortRef] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[PortRef] {
        &self.outputs
    }

    pub fn port(&self, direction: PortDirection, index: usize) -> Option<PortRef> {
        match direction {
            PortDirection::Input => self.inputs.get(index).copied(),
            PortDirection::Output => self.outputs.get(index).copied(),
        }
    }

    /// Smallest number of concrete ops any match of this graph binds.
    pub fn min_ops(&self) -> usize {
        self.nodes
            .iter()
            .map(|node| match node {
                PatternNode::Op(_) => 1,
                PatternNode::Alternation(branches) => branches
                    .iter()
                    .map(|branch| branch.min_ops())
                    .min()
                    .unwrap_or(0),
                PatternNode::Repetition(rep) => rep.body.min_ops().saturating_mul(rep.min),
            })
            .sum()
    }
}
