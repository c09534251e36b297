use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::graph::{OpKind, OpView};
use crate::pattern::{
    BuildError, OpMatcher, PatternEdge, PatternGraph, PatternNode, PortDirection, PortMap,
    PortRef, NodeId, Repetition,
};

/// Edge feeding `input_port` of a newly appended node from `producer_port` of `producer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InEdge {
    pub input_port: usize,
    pub producer: NodeId,
    pub producer_port: usize,
}

pub fn in_edge(input_port: usize, producer: NodeId, producer_port: usize) -> InEdge {
    InEdge {
        input_port,
        producer,
        producer_port,
    }
}

/// Incrementally assembles a [`PatternGraph`].
///
/// Nodes can only reference nodes appended before them, so the pattern is
/// acyclic by construction. The first appended node is the anchor.
#[derive(Debug, Default)]
pub struct PatternGraphBuilder {
    nodes: Vec<PatternNode>,
    edges: Vec<PatternEdge>,
    inputs: BTreeMap<usize, PortRef>,
    outputs: BTreeMap<usize, PortRef>,
}

impl PatternGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_op(
        &mut self,
        kinds: impl IntoIterator<Item = OpKind>,
        in_edges: impl IntoIterator<Item = InEdge>,
    ) -> Result<NodeId, BuildError> {
        let mut unique: Vec<OpKind> = Vec::new();
        for kind in kinds {
            if !unique.contains(&kind) {
                unique.push(kind);
            }
        }
        if unique.is_empty() {
            return Err(BuildError::EmptyKindSet);
        }
        self.append(PatternNode::Op(OpMatcher::new(unique)), in_edges)
    }

    pub fn append_alternation(
        &mut self,
        branches: Vec<Arc<PatternGraph>>,
        in_edges: impl IntoIterator<Item = InEdge>,
    ) -> Result<NodeId, BuildError> {
        if branches.is_empty() {
            return Err(BuildError::EmptyAlternation);
        }
        self.append(PatternNode::Alternation(branches), in_edges)
    }

    /// Alternation whose branches are single ops, one branch per kind set.
    pub fn append_alternation_ops(
        &mut self,
        kind_sets: Vec<Vec<OpKind>>,
        in_edges: impl IntoIterator<Item = InEdge>,
    ) -> Result<NodeId, BuildError> {
        let branches = kind_sets
            .into_iter()
            .map(|kinds| PatternGraph::single_op(kinds).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        self.append_alternation(branches, in_edges)
    }

    pub fn append_repetition(
        &mut self,
        body: Arc<PatternGraph>,
        port_map: PortMap,
        min: usize,
        max: usize,
        in_edges: impl IntoIterator<Item = InEdge>,
    ) -> Result<NodeId, BuildError> {
        if max == 0 || min > max {
            return Err(BuildError::InvalidRepetitionBounds { min, max });
        }
        if body.port(PortDirection::Output, port_map.output).is_none() {
            return Err(BuildError::MissingSubgraphPort {
                direction: PortDirection::Output,
                port: port_map.output,
            });
        }
        if body.port(PortDirection::Input, port_map.input).is_none() {
            return Err(BuildError::MissingSubgraphPort {
                direction: PortDirection::Input,
                port: port_map.input,
            });
        }
        self.append(
            PatternNode::Repetition(Repetition {
                body,
                port_map,
                min,
                max,
            }),
            in_edges,
        )
    }

    /// Zero-or-one occurrence of `body`, chained through port 0.
    pub fn append_optional(
        &mut self,
        body: Arc<PatternGraph>,
        in_edges: impl IntoIterator<Item = InEdge>,
    ) -> Result<NodeId, BuildError> {
        self.append_repetition(body, PortMap { output: 0, input: 0 }, 0, 1, in_edges)
    }

    pub fn append_decision_function(
        &mut self,
        node: NodeId,
        decision: impl Fn(&OpView<'_>) -> bool + Send + Sync + 'static,
    ) -> Result<(), BuildError> {
        match self.nodes.get_mut(node.index()) {
            Some(PatternNode::Op(matcher)) => {
                matcher.push_decision(Arc::new(decision));
                Ok(())
            }
            Some(_) => Err(BuildError::DecisionOnCompositeNode(node)),
            None => Err(BuildError::UnknownNode(node)),
        }
    }

    /// Exposes `node_port` of `node` as input port `index` of the finished graph.
    pub fn create_input_port(
        &mut self,
        index: usize,
        node: NodeId,
        node_port: usize,
    ) -> Result<(), BuildError> {
        self.bind_port(PortDirection::Input, index, node, node_port)
    }

    pub fn create_output_port(
        &mut self,
        index: usize,
        node: NodeId,
        node_port: usize,
    ) -> Result<(), BuildError> {
        self.bind_port(PortDirection::Output, index, node, node_port)
    }

    pub fn finish(self) -> Result<PatternGraph, BuildError> {
        if self.nodes.is_empty() {
            return Err(BuildError::EmptyPattern);
        }
        let inputs = dense_ports(PortDirection::Input, self.inputs)?;
        let outputs = dense_ports(PortDirection::Output, self.outputs)?;

        let mut in_edges = vec![Vec::new(); self.nodes.len()];
        let mut out_edges = vec![Vec::new(); self.nodes.len()];
        for (index, edge) in self.edges.iter().enumerate() {
            in_edges[edge.consumer.index()].push(index);
            out_edges[edge.producer.index()].push(index);
        }

        let mut reached: HashSet<usize> = HashSet::from([0]);
        let mut queue = VecDeque::from([0usize]);
        while let Some(node) = queue.pop_front() {
            let neighbours = in_edges[node]
                .iter()
                .map(|edge| self.edges[*edge].producer.index())
                .chain(
                    out_edges[node]
                        .iter()
                        .map(|edge| self.edges[*edge].consumer.index()),
                );
            for next in neighbours.collect::<Vec<_>>() {
                if reached.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        if let Some(orphan) = (0..self.nodes.len()).find(|node| !reached.contains(node)) {
            return Err(BuildError::Disconnected(NodeId(orphan as u32)));
        }

        Ok(PatternGraph {
            nodes: self.nodes,
            edges: self.edges,
            in_edges,
            out_edges,
            inputs,
            outputs,
        })
    }

    fn append(
        &mut self,
        node: PatternNode,
        in_edges: impl IntoIterator<Item = InEdge>,
    ) -> Result<NodeId, BuildError> {
        let id = NodeId(self.nodes.len() as u32);
        let mut edges = Vec::new();
        let mut seen_ports = HashSet::new();
        for edge in in_edges {
            let producer = self
                .nodes
                .get(edge.producer.index())
                .ok_or(BuildError::UnknownNode(edge.producer))?;
            if !producer.exposes(PortDirection::Output, edge.producer_port) {
                return Err(BuildError::MissingSubgraphPort {
                    direction: PortDirection::Output,
                    port: edge.producer_port,
                });
            }
            if !node.exposes(PortDirection::Input, edge.input_port) {
                return Err(BuildError::MissingSubgraphPort {
                    direction: PortDirection::Input,
                    port: edge.input_port,
                });
            }
            if !seen_ports.insert(edge.input_port) {
                return Err(BuildError::DuplicateInEdge {
                    node: id,
                    port: edge.input_port,
                });
            }
            edges.push(PatternEdge {
                producer: edge.producer,
                producer_port: edge.producer_port,
                consumer: id,
                consumer_port: edge.input_port,
            });
        }
        self.nodes.push(node);
        self.edges.extend(edges);
        Ok(id)
    }

    fn bind_port(
        &mut self,
        direction: PortDirection,
        index: usize,
        node: NodeId,
        node_port: usize,
    ) -> Result<(), BuildError> {
        let target = self
            .nodes
            .get(node.index())
            .ok_or(BuildError::UnknownNode(node))?;
        if !target.exposes(direction, node_port) {
            return Err(BuildError::MissingSubgraphPort {
                direction,
                port: node_port,
            });
        }
        let ports = match direction {
            PortDirection::Input => &mut self.inputs,
            PortDirection::Output => &mut self.outputs,
        };
        if ports.contains_key(&index) {
            return Err(BuildError::PortAlreadyBound { direction, index });
        }
        ports.insert(
            index,
            PortRef {
                node,
                port: node_port,
            },
        );
        Ok(())
    }
}

fn dense_ports(
    direction: PortDirection,
    ports: BTreeMap<usize, PortRef>,
) -> Result<Vec<PortRef>, BuildError> {
    let mut dense = Vec::with_capacity(ports.len());
    for (expected, (index, port)) in ports.into_iter().enumerate() {
        if index != expected {
            return Err(BuildError::UnboundPort {
                direction,
                index: expected,
            });
        }
        dense.push(port);
    }
    Ok(dense)
}
