use std::collections::HashSet;

use smallvec::SmallVec;

use crate::graph::topology::is_convex;
use crate::graph::{Graph, OpId, OpKind};
use crate::matcher::state::{Entry, MatchState, NodeBinding};
use crate::matcher::MatchConfig;
use crate::pattern::{NodeId, OpMatcher, PatternGraph, PatternNode, Repetition};

/// Continuation receiving the port binding of whatever was just matched.
///
/// Returns `Some` once the whole pattern is accepted. On `None` the state is
/// left as the continuation found it.
type Cont<'c> = dyn FnMut(NodeBinding, &mut MatchState) -> Option<()> + 'c;

enum Step {
    Enter { node: NodeId, entry: Entry },
    Done,
    Stuck,
}

/// Backtracking search for one embedding of a pattern graph.
///
/// Every `enter_*` function binds one pattern node and then hands the
/// binding to a continuation that matches the rest of the pattern. A
/// continuation returning `None` makes the caller try its next choice, which
/// is how op candidates and repetition counts backtrack. Alternation branches
/// are committed as soon as one matches on its own.
///
/// All functions share one [`MatchState`]. A function that fails restores
/// the state to what it was on entry.
pub(crate) struct Solver<'a> {
    graph: &'a Graph,
    excluded: &'a HashSet<OpId>,
    config: MatchConfig,
}

impl<'a> Solver<'a> {
    pub(crate) fn new(graph: &'a Graph, excluded: &'a HashSet<OpId>, config: MatchConfig) -> Self {
        Self {
            graph,
            excluded,
            config,
        }
    }

    /// Matches `pattern` with its anchor bound to `anchor`.
    pub(crate) fn solve_anchored(&self, pattern: &PatternGraph, anchor: OpId) -> Option<Vec<OpId>> {
        let graph = self.graph;
        let check_convexity = self.config.check_convexity;
        let mut accept = |_ports: NodeBinding, state: &mut MatchState| {
            if check_convexity && !is_convex(graph, state.members()) {
                return None;
            }
            Some(())
        };
        let mut state = MatchState::default();
        self.match_graph(
            pattern,
            pattern.anchor(),
            Entry::Anchor(anchor),
            &mut state,
            &mut accept,
        )?;
        Some(state.into_ops())
    }

    fn match_graph(
        &self,
        pattern: &PatternGraph,
        seed: NodeId,
        entry: Entry,
        state: &mut MatchState,
        k: &mut Cont<'_>,
    ) -> Option<()> {
        let bindings: Vec<Option<NodeBinding>> = vec![None; pattern.nodes().len()];
        self.bind_and_solve(pattern, bindings, seed, entry, state, k)
    }

    fn bind_and_solve(
        &self,
        pattern: &PatternGraph,
        bindings: Vec<Option<NodeBinding>>,
        node: NodeId,
        entry: Entry,
        state: &mut MatchState,
        k: &mut Cont<'_>,
    ) -> Option<()> {
        let mut bind = |binding: NodeBinding, state: &mut MatchState| {
            let mut next = bindings.clone();
            next[node.index()] = Some(binding);
            if !edges_consistent(pattern, &next, node) {
                return None;
            }
            self.solve(pattern, next, state, &mut *k)
        };
        self.enter_node(pattern, node, entry, state, &mut bind)
    }

    fn solve(
        &self,
        pattern: &PatternGraph,
        bindings: Vec<Option<NodeBinding>>,
        state: &mut MatchState,
        k: &mut Cont<'_>,
    ) -> Option<()> {
        match next_step(pattern, &bindings) {
            Step::Done => k(graph_ports(pattern, &bindings), state),
            Step::Stuck => None,
            Step::Enter { node, entry } => {
                self.bind_and_solve(pattern, bindings, node, entry, state, k)
            }
        }
    }

    fn enter_node(
        &self,
        pattern: &PatternGraph,
        node: NodeId,
        entry: Entry,
        state: &mut MatchState,
        k: &mut Cont<'_>,
    ) -> Option<()> {
        match pattern.node(node)? {
            PatternNode::Op(matcher) => self.enter_op(matcher, entry, state, k),
            PatternNode::Alternation(branches) => {
                let mark = state.len();
                for branch in branches {
                    if let Some(ports) = self.first_match(branch, entry, state) {
                        let done = k(ports, state);
                        if done.is_none() {
                            state.truncate(mark);
                        }
                        return done;
                    }
                }
                None
            }
            PatternNode::Repetition(repetition) => {
                self.enter_repetition(repetition, entry, state, k)
            }
        }
    }

    fn enter_op(
        &self,
        matcher: &OpMatcher,
        entry: Entry,
        state: &mut MatchState,
        k: &mut Cont<'_>,
    ) -> Option<()> {
        let mark = state.len();
        for (candidate, swapped) in self.candidates(entry) {
            if state.contains(candidate) || self.excluded.contains(&candidate) {
                continue;
            }
            let Some(view) = self.graph.view(candidate) else {
                continue;
            };
            if !matcher.accepts(&view) {
                continue;
            }
            let op = view.op();
            let mut inputs: Vec<_> = op.inputs.iter().copied().map(Some).collect();
            if swapped {
                inputs.swap(0, 1);
            }
            let binding = NodeBinding {
                inputs,
                outputs: op.outputs.iter().copied().map(Some).collect(),
            };
            state.push(candidate);
            if k(binding, state).is_some() {
                return Some(());
            }
            state.truncate(mark);
        }
        None
    }

    /// Concrete ops that could bind a node reached through `entry`, each with
    /// a flag telling whether its two inputs are bound swapped.
    fn candidates(&self, entry: Entry) -> SmallVec<[(OpId, bool); 4]> {
        let mut out: SmallVec<[(OpId, bool); 4]> = SmallVec::new();
        match entry {
            Entry::Anchor(op) => self.push_orientations(op, &mut out),
            Entry::Output { port, tensor } => {
                if let Some((op, producer_port)) = self.graph.index().producer(tensor) {
                    if producer_port == port {
                        self.push_orientations(op, &mut out);
                    }
                }
            }
            Entry::Input { port, tensor } => {
                for &(op, consumer_port) in self.graph.consumers(tensor) {
                    let candidate = if consumer_port == port {
                        Some((op, false))
                    } else if port < 2 && consumer_port < 2 && self.swappable(op) {
                        Some((op, true))
                    } else {
                        None
                    };
                    if let Some(candidate) = candidate {
                        if !out.contains(&candidate) {
                            out.push(candidate);
                        }
                    }
                }
            }
        }
        out
    }

    fn push_orientations(&self, op: OpId, out: &mut SmallVec<[(OpId, bool); 4]>) {
        out.push((op, false));
        if self.swappable(op) {
            out.push((op, true));
        }
    }

    fn swappable(&self, op: OpId) -> bool {
        self.config.allow_commutative_inputs
            && self.graph.op(op).is_some_and(|op| {
                OpKind::is_commutative(op.kind) && op.inputs.len() == 2 && op.inputs[0] != op.inputs[1]
            })
    }

    /// Matches `subgraph` on its own and returns its port binding, committing
    /// to the first embedding found. The ops it bound stay in `state`.
    fn first_match(
        &self,
        subgraph: &PatternGraph,
        entry: Entry,
        state: &mut MatchState,
    ) -> Option<NodeBinding> {
        let (seed, inner) = entry.into_subgraph(subgraph)?;
        let mut ports = None;
        let mut capture = |binding: NodeBinding, _state: &mut MatchState| {
            ports = Some(binding);
            Some(())
        };
        self.match_graph(subgraph, seed, inner, state, &mut capture)?;
        ports
    }

    fn enter_repetition(
        &self,
        repetition: &Repetition,
        entry: Entry,
        state: &mut MatchState,
        k: &mut Cont<'_>,
    ) -> Option<()> {
        let body = repetition.body.as_ref();
        let chain_out = repetition.port_map.output;
        let chain_in = repetition.port_map.input;
        // Entered from the producer side the chain grows along data flow,
        // otherwise it grows backwards from its last instance.
        let forward = !matches!(entry, Entry::Output { .. });

        let mark = state.len();
        // Port binding of each instance and the state length right after it.
        let mut instances: Vec<(NodeBinding, usize)> = Vec::new();
        let mut next_entry = Some(entry);
        while instances.len() < repetition.max {
            let Some(instance_entry) = next_entry.take() else {
                break;
            };
            let Some(ports) = self.first_match(body, instance_entry, state) else {
                break;
            };
            next_entry = if forward {
                ports.output(chain_out).map(|tensor| Entry::Input {
                    port: chain_in,
                    tensor,
                })
            } else {
                ports.input(chain_in).map(|tensor| Entry::Output {
                    port: chain_out,
                    tensor,
                })
            };
            instances.push((ports, state.len()));
        }

        for count in (repetition.min..=instances.len()).rev() {
            let attempt = if count == 0 {
                state.truncate(mark);
                zero_trip(body, repetition, entry)
            } else {
                state.truncate(instances[count - 1].1);
                let (first, last) = if forward {
                    (&instances[0].0, &instances[count - 1].0)
                } else {
                    (&instances[count - 1].0, &instances[0].0)
                };
                Some(NodeBinding {
                    inputs: first.inputs.clone(),
                    outputs: last.outputs.clone(),
                })
            };
            let Some(ports) = attempt else {
                continue;
            };
            if k(ports, state).is_some() {
                return Some(());
            }
        }
        state.truncate(mark);
        None
    }
}

/// Binding of a repetition with no instances: the chained input port and
/// output port carry the same tensor.
fn zero_trip(body: &PatternGraph, repetition: &Repetition, entry: Entry) -> Option<NodeBinding> {
    let tensor = match entry {
        Entry::Input { port, tensor } if port == repetition.port_map.input => tensor,
        Entry::Output { port, tensor } if port == repetition.port_map.output => tensor,
        _ => return None,
    };
    let mut ports = NodeBinding::with_ports(body.inputs().len(), body.outputs().len());
    ports.inputs[repetition.port_map.input] = Some(tensor);
    ports.outputs[repetition.port_map.output] = Some(tensor);
    Some(ports)
}

/// Picks the next unbound node to visit: producers feeding bound nodes
/// first, then consumers of bound nodes.
fn next_step(pattern: &PatternGraph, bindings: &[Option<NodeBinding>]) -> Step {
    for (index, binding) in bindings.iter().enumerate() {
        let Some(binding) = binding else {
            continue;
        };
        for edge in pattern.in_edges(NodeId(index as u32)) {
            if bindings[edge.producer.index()].is_none() {
                return match binding.input(edge.consumer_port) {
                    Some(tensor) => Step::Enter {
                        node: edge.producer,
                        entry: Entry::Output {
                            port: edge.producer_port,
                            tensor,
                        },
                    },
                    None => Step::Stuck,
                };
            }
        }
    }
    for (index, binding) in bindings.iter().enumerate() {
        let Some(binding) = binding else {
            continue;
        };
        for edge in pattern.out_edges(NodeId(index as u32)) {
            if bindings[edge.consumer.index()].is_none() {
                return match binding.output(edge.producer_port) {
                    Some(tensor) => Step::Enter {
                        node: edge.consumer,
                        entry: Entry::Input {
                            port: edge.consumer_port,
                            tensor,
                        },
                    },
                    None => Step::Stuck,
                };
            }
        }
    }
    if bindings.iter().all(Option::is_some) {
        Step::Done
    } else {
        Step::Stuck
    }
}

/// Every edge between `node` and an already bound node carries one tensor.
fn edges_consistent(pattern: &PatternGraph, bindings: &[Option<NodeBinding>], node: NodeId) -> bool {
    let endpoint = |id: NodeId| bindings.get(id.index()).and_then(Option::as_ref);
    pattern
        .in_edges(node)
        .chain(pattern.out_edges(node))
        .all(|edge| match (endpoint(edge.producer), endpoint(edge.consumer)) {
            (Some(producer), Some(consumer)) => {
                let produced = producer.output(edge.producer_port);
                produced.is_some() && produced == consumer.input(edge.consumer_port)
            }
            _ => true,
        })
}

fn graph_ports(pattern: &PatternGraph, bindings: &[Option<NodeBinding>]) -> NodeBinding {
    let lookup = |node: NodeId| bindings.get(node.index()).and_then(Option::as_ref);
    NodeBinding {
        inputs: pattern
            .inputs()
            .iter()
            .map(|port| lookup(port.node).and_then(|binding| binding.input(port.port)))
            .collect(),
        outputs: pattern
            .outputs()
            .iter()
            .map(|port| lookup(port.node).and_then(|binding| binding.output(port.port)))
            .collect(),
    }
}
