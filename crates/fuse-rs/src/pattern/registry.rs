//! Named, prioritized patterns grouped by backend.
//!
//! Backends contribute their pattern sets through [`PATTERN_REGISTRARS`];
//! [`default_registry`] collects every linked registrar once per process.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::graph::{AttrValue, Attributes, Graph, Op, OpId, OpView};
use crate::pattern::{BuildError, PatternGraph};

/// What the fused node of a match looks like.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FusedOpSpec {
    pub kind: String,
    pub attrs: Attributes,
}

/// Members of a match handed to a [`FusedOpFactory`].
pub struct FusionContext<'g> {
    graph: &'g Graph,
    members: &'g [OpId],
    pattern: &'g str,
}

impl<'g> FusionContext<'g> {
    pub(crate) fn new(graph: &'g Graph, members: &'g [OpId], pattern: &'g str) -> Self {
        Self {
            graph,
            members,
            pattern,
        }
    }

    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    /// Member ids in topological order.
    pub fn members(&self) -> &'g [OpId] {
        self.members
    }

    pub fn ops(&self) -> impl Iterator<Item = &'g Op> + '_ {
        self.members.iter().filter_map(|id| self.graph.op(*id))
    }

    pub fn views(&self) -> impl Iterator<Item = OpView<'g>> + '_ {
        self.members.iter().filter_map(|id| self.graph.view(*id))
    }

    pub fn pattern_name(&self) -> &'g str {
        self.pattern
    }
}

pub type FusedOpFactory = Arc<dyn Fn(&FusionContext<'_>) -> FusedOpSpec + Send + Sync>;

/// Factory producing a fused node of `kind` with no extra attributes.
pub fn fused_op(kind: &'static str) -> FusedOpFactory {
    Arc::new(move |_ctx: &FusionContext<'_>| FusedOpSpec {
        kind: kind.to_string(),
        attrs: Attributes::new(),
    })
}

/// Factory that also records the kinds of post-ops after the first member.
pub fn fused_op_with_post_ops(kind: &'static str) -> FusedOpFactory {
    Arc::new(move |ctx: &FusionContext<'_>| {
        let post_ops: Vec<String> = ctx
            .ops()
            .skip(1)
            .map(|op| op.kind.as_str().to_string())
            .collect();
        let mut attrs = Attributes::new();
        if !post_ops.is_empty() {
            attrs.insert("post_ops".to_string(), AttrValue::Strs(post_ops));
        }
        FusedOpSpec {
            kind: kind.to_string(),
            attrs,
        }
    })
}

/// What happens to the ops of a successful match.
#[derive(Clone)]
pub enum PatternAction {
    /// Splice a fused node into the working graph.
    Fuse(FusedOpFactory),
    /// Claim the matched ops as a partition without rewriting the graph.
    Partition,
}

impl fmt::Debug for PatternAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternAction::Fuse(_) => f.write_str("Fuse(..)"),
            PatternAction::Partition => f.write_str("Partition"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionCategory {
    ConvolutionPostOps,
    MatMulPostOps,
    QuantizedConvolution,
    QuantizedMatMul,
    QuantizedEltwise,
    EltwisePostOps,
    NormPostOps,
    ReorderPostOps,
    SingleOp,
    Misc,
}

#[derive(Debug)]
pub struct RegisteredPattern {
    name: String,
    backend: String,
    graph: Arc<PatternGraph>,
    priority: f32,
    category: PartitionCategory,
    action: PatternAction,
    sequence: usize,
}

impl RegisteredPattern {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn graph(&self) -> &PatternGraph {
        &self.graph
    }

    pub fn priority(&self) -> f32 {
        self.priority
    }

    pub fn category(&self) -> PartitionCategory {
        self.category
    }

    pub fn action(&self) -> &PatternAction {
        &self.action
    }

    /// Registration order within the registry.
    pub fn sequence(&self) -> usize {
        self.sequence
    }

    /// Higher priority first; earlier registration breaks ties.
    pub fn apply_order(&self, other: &Self) -> Ordering {
        other
            .priority
            .total_cmp(&self.priority)
            .then(self.sequence.cmp(&other.sequence))
    }
}

#[derive(Debug, Default)]
pub struct PatternRegistryBuilder {
    patterns: Vec<RegisteredPattern>,
}

impl PatternRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        backend: impl Into<String>,
        graph: impl Into<Arc<PatternGraph>>,
        priority: f32,
        category: PartitionCategory,
        action: PatternAction,
    ) -> Result<&mut Self, BuildError> {
        let name = name.into();
        let backend = backend.into();
        if name.is_empty() {
            return Err(BuildError::EmptyName);
        }
        if !priority.is_finite() {
            return Err(BuildError::InvalidPriority { name });
        }
        if self
            .patterns
            .iter()
            .any(|pattern| pattern.name == name && pattern.backend == backend)
        {
            return Err(BuildError::DuplicatePattern { name, backend });
        }
        let sequence = self.patterns.len();
        self.patterns.push(RegisteredPattern {
            name,
            backend,
            graph: graph.into(),
            priority,
            category,
            action,
            sequence,
        });
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn freeze(self) -> PatternRegistry {
        let mut patterns: Vec<Arc<RegisteredPattern>> =
            self.patterns.into_iter().map(Arc::new).collect();
        patterns.sort_by(|a, b| a.apply_order(b));
        PatternRegistry { patterns }
    }
}

/// Frozen registry, iterated in application order.
#[derive(Debug, Default, Clone)]
pub struct PatternRegistry {
    patterns: Vec<Arc<RegisteredPattern>>,
}

impl PatternRegistry {
    pub fn builder() -> PatternRegistryBuilder {
        PatternRegistryBuilder::new()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RegisteredPattern>> {
        self.patterns.iter()
    }

    pub fn get(&self, name: &str, backend: &str) -> Option<&Arc<RegisteredPattern>> {
        self.patterns
            .iter()
            .find(|pattern| pattern.name == name && pattern.backend == backend)
    }

    /// Patterns of the given backends, in application order.
    pub fn patterns_for<S: AsRef<str>>(&self, backends: &[S]) -> Vec<Arc<RegisteredPattern>> {
        self.patterns
            .iter()
            .filter(|pattern| {
                backends
                    .iter()
                    .any(|backend| backend.as_ref() == pattern.backend)
            })
            .cloned()
            .collect()
    }

    pub fn backends(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.patterns.iter().map(|p| p.backend.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

/// Link-time contribution of a pattern set.
pub struct PatternRegistrar {
    pub name: &'static str,
    pub register: fn(&mut PatternRegistryBuilder) -> Result<(), BuildError>,
}

#[linkme::distributed_slice]
pub static PATTERN_REGISTRARS: [PatternRegistrar] = [..];

/// Builds a registry from `registrars`, run in name order so link order does not matter.
pub fn registry_from_registrars(
    registrars: &[PatternRegistrar],
) -> Result<PatternRegistry, BuildError> {
    let mut ordered: Vec<&PatternRegistrar> = registrars.iter().collect();
    ordered.sort_by_key(|registrar| registrar.name);
    let mut builder = PatternRegistryBuilder::new();
    for registrar in ordered {
        (registrar.register)(&mut builder)?;
        tracing::debug!(
            registrar = registrar.name,
            patterns = builder.len(),
            "pattern registrar applied"
        );
    }
    Ok(builder.freeze())
}

static DEFAULT_REGISTRY: Lazy<Result<PatternRegistry, BuildError>> =
    Lazy::new(|| registry_from_registrars(&PATTERN_REGISTRARS));

/// Registry holding every pattern set linked into the binary.
pub fn default_registry() -> Result<&'static PatternRegistry, BuildError> {
    DEFAULT_REGISTRY.as_ref().map_err(Clone::clone)
}
