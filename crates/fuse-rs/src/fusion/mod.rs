//! Pattern application: claims ops with the highest-priority patterns,
//! splices fused nodes into a working graph and cuts the input graph into
//! partitions.

mod config;
mod dump;
mod partition;
mod plan_cache;

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::env;
use crate::graph::topology::is_convex;
use crate::graph::{Graph, GraphError, GraphRewriter, Op, OpId};
use crate::matcher::Matcher;
use crate::pattern::{FusionContext, PatternAction, PatternRegistry, RegisteredPattern};
use crate::profiling;
use crate::signature::graph_signature;

pub use config::{ConfigError, FusionConfig, DEFAULT_MAX_PASSES};
pub use dump::dump_partitions;
pub use partition::{Partition, PartitionId};

use partition::PartitionOrigin;
use plan_cache::{PartitionPlan, PlanCache, PlannedGroup};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FusionStats {
    /// Sweeps over the pattern list, including the final one that found nothing.
    pub rounds: usize,
    /// Matches applied, fused or not.
    pub matches: usize,
    /// Fused nodes spliced into the working graph.
    pub fused_ops: usize,
    /// Matches claimed by partition-action patterns.
    pub partitioned: usize,
    /// Leftover ops that became unsupported singleton partitions.
    pub singletons: usize,
    pub plan_cache_hit: bool,
}

#[derive(Debug, Clone)]
pub struct FusionOutcome {
    /// Input graph with every fused match contracted into one node.
    pub graph: Graph,
    /// Partitions over the ops of the input graph, ordered by first member.
    pub partitions: Vec<Partition>,
    pub stats: FusionStats,
}

/// A match applied to the working graph.
struct AppliedGroup {
    pattern: usize,
    members: Vec<OpId>,
    fused_op: Option<Op>,
}

/// Applies the patterns of a set of backends to graphs.
pub struct FusionManager {
    patterns: Vec<Arc<RegisteredPattern>>,
    config: FusionConfig,
    plan_cache: Option<PlanCache>,
}

impl FusionManager {
    pub fn new<S: AsRef<str>>(registry: &PatternRegistry, backends: &[S], config: FusionConfig) -> Self {
        let patterns: Vec<Arc<RegisteredPattern>> = registry
            .patterns_for(backends)
            .into_iter()
            .filter(|pattern| !config.is_disabled(pattern.name()))
            .collect();
        tracing::debug!(
            patterns = patterns.len(),
            max_passes = config.max_passes,
            "fusion manager ready"
        );
        let plan_cache = PlanCache::new(config.plan_cache_capacity);
        Self {
            patterns,
            config,
            plan_cache,
        }
    }

    /// Patterns in the order they are tried.
    pub fn patterns(&self) -> &[Arc<RegisteredPattern>] {
        &self.patterns
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Number of memoized partition plans.
    pub fn cached_plans(&self) -> usize {
        self.plan_cache.as_ref().map_or(0, PlanCache::len)
    }

    /// Partitions covering every op of `graph` exactly once.
    pub fn apply_patterns(&self, graph: &Graph) -> Vec<Partition> {
        self.rewrite(graph).partitions
    }

    pub fn rewrite(&self, graph: &Graph) -> FusionOutcome {
        let _scope = profiling::pass_scope("fusion_rewrite");
        let signature = match (&self.plan_cache, graph_signature(graph)) {
            (Some(_), Ok(signature)) => Some(signature),
            (Some(_), Err(err)) => {
                tracing::warn!("skipping partition plan memo: {err}");
                None
            }
            (None, _) => None,
        };

        if let (Some(cache), Some(signature)) = (&self.plan_cache, signature) {
            if let Some(plan) = cache.get(signature) {
                match self.replay(graph, &plan) {
                    Ok(outcome) => return outcome,
                    Err(err) => tracing::warn!("partition plan replay failed, re-matching: {err}"),
                }
            }
        }

        let (working, groups, stats) = self.run_passes(graph);
        if let (Some(cache), Some(signature)) = (&self.plan_cache, signature) {
            let planned = groups
                .iter()
                .map(|group| PlannedGroup {
                    pattern: group.pattern,
                    members: group
                        .members
                        .iter()
                        .filter_map(|op| graph.position(*op))
                        .collect(),
                })
                .collect();
            cache.insert(
                signature,
                PartitionPlan {
                    groups: planned,
                    stats,
                },
            );
        }
        self.assemble(graph, working, groups, stats)
    }

    fn run_passes(&self, graph: &Graph) -> (Graph, Vec<AppliedGroup>, FusionStats) {
        let mut working = graph.clone();
        let mut claimed: HashSet<OpId> = HashSet::new();
        let mut groups = Vec::new();
        let mut next_fused = first_fused_id(graph);
        let mut stats = FusionStats::default();

        for round in 0..self.config.max_passes {
            stats.rounds += 1;
            let mut progress = false;
            for (index, pattern) in self.patterns.iter().enumerate() {
                let _scope = profiling::pass_scope("pattern");
                let matches = Matcher::new(&working, self.config.match_config)
                    .find_all(pattern.graph(), &claimed);
                for found in matches {
                    let members = found.op_set();
                    // An earlier contraction in this sweep may have closed a path around the match.
                    if self.config.match_config.check_convexity && !is_convex(&working, &members) {
                        tracing::debug!(
                            pattern = pattern.name(),
                            anchor = %found.anchor(),
                            "match no longer convex, deferring"
                        );
                        continue;
                    }
                    let fused_op = self.apply_group(&mut working, index, found.ops(), &mut next_fused);
                    match &fused_op {
                        Some(op) => {
                            claimed.insert(op.id);
                            stats.fused_ops += 1;
                        }
                        None => {
                            claimed.extend(found.ops().iter().copied());
                            stats.partitioned += 1;
                        }
                    }
                    tracing::debug!(
                        pattern = pattern.name(),
                        round,
                        ops = found.len(),
                        "pattern applied"
                    );
                    stats.matches += 1;
                    progress = true;
                    groups.push(AppliedGroup {
                        pattern: index,
                        members: found.ops().to_vec(),
                        fused_op,
                    });
                }
            }
            if !progress {
                break;
            }
        }
        (working, groups, stats)
    }

    /// Applies one match to `working`; returns the fused node for fuse-action patterns.
    fn apply_group(
        &self,
        working: &mut Graph,
        pattern_index: usize,
        members: &[OpId],
        next_fused: &mut u64,
    ) -> Option<Op> {
        let pattern = &self.patterns[pattern_index];
        let PatternAction::Fuse(factory) = pattern.action() else {
            return None;
        };
        let spec = factory(&FusionContext::new(&*working, members, pattern.name()));
        let set: HashSet<OpId> = members.iter().copied().collect();
        let id = OpId(*next_fused);
        match GraphRewriter::new(working).fuse(&set, id, &spec.kind, spec.attrs) {
            Ok(op) => {
                *next_fused += 1;
                Some(op)
            }
            Err(err) => {
                tracing::warn!(
                    pattern = pattern.name(),
                    "cannot splice fused node, keeping ops unfused: {err}"
                );
                None
            }
        }
    }

    fn replay(&self, graph: &Graph, plan: &PartitionPlan) -> Result<FusionOutcome, GraphError> {
        let mut working = graph.clone();
        let mut next_fused = first_fused_id(graph);
        let mut groups = Vec::with_capacity(plan.groups.len());
        for planned in &plan.groups {
            let members = planned
                .members
                .iter()
                .map(|position| {
                    graph
                        .ops()
                        .get(*position)
                        .map(|op| op.id)
                        .ok_or(GraphError::UnknownOp {
                            op: OpId(*position as u64),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let fused_op = self.apply_group(&mut working, planned.pattern, &members, &mut next_fused);
            groups.push(AppliedGroup {
                pattern: planned.pattern,
                members,
                fused_op,
            });
        }
        let stats = FusionStats {
            plan_cache_hit: true,
            ..plan.stats
        };
        Ok(self.assemble(graph, working, groups, stats))
    }

    fn assemble(
        &self,
        graph: &Graph,
        working: Graph,
        groups: Vec<AppliedGroup>,
        mut stats: FusionStats,
    ) -> FusionOutcome {
        let mut covered: HashSet<OpId> = HashSet::new();
        let mut drafts: Vec<(usize, HashSet<OpId>, Option<PartitionOrigin>)> = Vec::new();
        for group in groups {
            let pattern = &self.patterns[group.pattern];
            let first = group
                .members
                .iter()
                .filter_map(|op| graph.position(*op))
                .min()
                .unwrap_or(usize::MAX);
            covered.extend(group.members.iter().copied());
            drafts.push((
                first,
                group.members.into_iter().collect(),
                Some(PartitionOrigin {
                    backend: pattern.backend().to_string(),
                    category: pattern.category(),
                    pattern: pattern.name().to_string(),
                    fused_op: group.fused_op,
                }),
            ));
        }

        let mut singletons = 0;
        for (position, op) in graph.ops().iter().enumerate() {
            if !covered.contains(&op.id) {
                singletons += 1;
                drafts.push((position, HashSet::from([op.id]), None));
            }
        }
        drafts.sort_by_key(|(first, _, _)| *first);
        stats.singletons = singletons;

        let partitions: Vec<Partition> = drafts
            .into_iter()
            .enumerate()
            .map(|(index, (_, members, origin))| {
                Partition::build(PartitionId(index as u64), graph, &members, origin)
            })
            .collect();

        tracing::debug!(
            partitions = partitions.len(),
            rounds = stats.rounds,
            matches = stats.matches,
            singletons = stats.singletons,
            plan_cache_hit = stats.plan_cache_hit,
            "graph partitioned"
        );
        if env::dump_enabled() {
            tracing::info!(target: "fuse_rs::dump", "{}", dump_partitions(&partitions));
        }

        FusionOutcome {
            graph: working,
            partitions,
            stats,
        }
    }
}

fn first_fused_id(graph: &Graph) -> u64 {
    graph.max_op_id().map_or(0, |id| id.0 + 1)
}
