//! Finds embeddings of pattern graphs in a concrete graph.
//!
//! Matching never mutates the graph. A match is anchored: the pattern's
//! node 0 binds the op the search starts from, and the rest of the pattern
//! is discovered by walking edges outwards from it.

mod solver;
mod state;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::graph::{Graph, OpId};
use crate::pattern::PatternGraph;

use solver::Solver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Lets `Add`, `Multiply`, `Maximum` and `Minimum` bind their inputs in either order.
    pub allow_commutative_inputs: bool,
    /// Rejects matches whose contraction would create a cycle.
    pub check_convexity: bool,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            allow_commutative_inputs: true,
            check_convexity: true,
        }
    }
}

/// One embedding of a pattern: the set of concrete ops it binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    anchor: OpId,
    ops: Vec<OpId>,
}

impl PatternMatch {
    pub fn anchor(&self) -> OpId {
        self.anchor
    }

    /// Bound ops in topological order.
    pub fn ops(&self) -> &[OpId] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn contains(&self, op: OpId) -> bool {
        self.ops.contains(&op)
    }

    pub fn op_set(&self) -> HashSet<OpId> {
        self.ops.iter().copied().collect()
    }
}

pub struct Matcher<'g> {
    graph: &'g Graph,
    config: MatchConfig,
}

impl<'g> Matcher<'g> {
    pub fn new(graph: &'g Graph, config: MatchConfig) -> Self {
        Self { graph, config }
    }

    /// Tries to embed `pattern` with its anchor bound to `anchor`, skipping `excluded` ops.
    pub fn match_at(
        &self,
        pattern: &PatternGraph,
        anchor: OpId,
        excluded: &HashSet<OpId>,
    ) -> Option<PatternMatch> {
        if excluded.contains(&anchor) {
            return None;
        }
        let solver = Solver::new(self.graph, excluded, self.config);
        let mut ops = solver.solve_anchored(pattern, anchor)?;
        ops.sort_by_key(|op| self.graph.position(*op).unwrap_or(usize::MAX));
        Some(PatternMatch { anchor, ops })
    }

    /// Non-overlapping matches of `pattern`, trying anchors in topological order.
    pub fn find_all(&self, pattern: &PatternGraph, excluded: &HashSet<OpId>) -> Vec<PatternMatch> {
        let mut taken = excluded.clone();
        let mut matches = Vec::new();
        for op in self.graph.ops() {
            if taken.contains(&op.id) {
                continue;
            }
            if let Some(found) = self.match_at(pattern, op.id, &taken) {
                taken.extend(found.ops.iter().copied());
                matches.push(found);
            }
        }
        matches
    }
}
