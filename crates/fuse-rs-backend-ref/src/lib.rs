//! Reference backend for fuse-rs: registers the standard pattern library
//! under `"ref"` and lowers supported partitions into kernel plans.

pub mod compiler;
pub mod plan;
mod shapes;

use std::sync::Arc;

use anyhow::{Context, Result};
use fuse_rs::compile::{compile_partition, CacheConfig, CompiledPartitionCache, EngineProbe};
use fuse_rs::fusion::{FusionConfig, FusionManager, FusionOutcome, Partition, PartitionId};
use fuse_rs::graph::Graph;
use fuse_rs::pattern::{
    default_registry, BuildError, PatternRegistrar, PatternRegistry, PatternRegistryBuilder,
};

pub use compiler::{RefCompiler, RefEngine};
pub use plan::{KernelPlan, KernelStep};

pub const BACKEND_NAME: &str = "ref";

/// Registers the standard pattern library for the reference backend.
pub fn register_ref_patterns(builder: &mut PatternRegistryBuilder) -> Result<(), BuildError> {
    fuse_rs::passes::register_standard_patterns(builder, BACKEND_NAME)
}

#[linkme::distributed_slice(fuse_rs::pattern::PATTERN_REGISTRARS)]
static REGISTER_REF_PATTERNS: PatternRegistrar = PatternRegistrar {
    name: BACKEND_NAME,
    register: register_ref_patterns,
};

/// Result of [`RefRuntime::compile_graph`].
#[derive(Debug)]
pub struct CompiledGraph {
    pub outcome: FusionOutcome,
    /// Plans of supported partitions, in partition order.
    pub kernels: Vec<(PartitionId, Arc<KernelPlan>)>,
    /// Partitions the backend does not handle; the caller has to run them elsewhere.
    pub fallback: Vec<PartitionId>,
}

impl CompiledGraph {
    pub fn partitions(&self) -> &[Partition] {
        &self.outcome.partitions
    }

    pub fn plan(&self, partition: PartitionId) -> Option<&Arc<KernelPlan>> {
        self.kernels
            .iter()
            .find(|(id, _)| *id == partition)
            .map(|(_, plan)| plan)
    }
}

/// Partitioning, compilation and plan caching wired together for `"ref"`.
pub struct RefRuntime {
    engine: Arc<RefEngine>,
    compiler: RefCompiler,
    manager: FusionManager,
    cache: CompiledPartitionCache<KernelPlan>,
}

impl RefRuntime {
    /// Runtime over the link-time pattern registry.
    pub fn new(fusion: FusionConfig, cache: CacheConfig) -> Result<Self> {
        let registry = default_registry().context("failed to build the pattern registry")?;
        Ok(Self::with_registry(registry, fusion, cache))
    }

    /// Runtime configured from `FUSE_RS_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(FusionConfig::from_env(), CacheConfig::from_env())
    }

    pub fn with_registry(registry: &PatternRegistry, fusion: FusionConfig, cache: CacheConfig) -> Self {
        let engine = Arc::new(RefEngine::new());
        let probe: Arc<dyn EngineProbe> = engine.clone();
        Self {
            compiler: RefCompiler::new(Arc::clone(&engine)),
            manager: FusionManager::new(registry, &[BACKEND_NAME], fusion),
            cache: CompiledPartitionCache::with_config(cache).with_probe(probe),
            engine,
        }
    }

    pub fn engine(&self) -> &Arc<RefEngine> {
        &self.engine
    }

    pub fn compiler(&self) -> &RefCompiler {
        &self.compiler
    }

    pub fn manager(&self) -> &FusionManager {
        &self.manager
    }

    pub fn cache(&self) -> &CompiledPartitionCache<KernelPlan> {
        &self.cache
    }

    /// Partitions `graph` and compiles every supported partition through the cache.
    pub fn compile_graph(&self, graph: &Graph) -> Result<CompiledGraph> {
        let outcome = self.manager.rewrite(graph);
        let mut kernels = Vec::new();
        let mut fallback = Vec::new();
        for partition in &outcome.partitions {
            if !partition.is_supported() {
                fallback.push(partition.id());
                continue;
            }
            let handle = compile_partition(
                &self.cache,
                &self.compiler,
                partition,
                partition.inputs(),
                partition.outputs(),
            )
            .with_context(|| format!("failed to fingerprint partition {}", partition.id()))?;
            let plan = handle.artifact().with_context(|| {
                format!(
                    "failed to compile partition {} ({})",
                    partition.id(),
                    partition.pattern_name().unwrap_or("unnamed")
                )
            })?;
            let plan = if plan.is_bound_to(partition) {
                plan
            } else {
                // Structurally identical partitions share one cached plan.
                plan.rebind(partition).map(Arc::new).with_context(|| {
                    format!("cached plan does not fit partition {}", partition.id())
                })?
            };
            kernels.push((partition.id(), plan));
        }
        tracing::debug!(
            partitions = outcome.partitions.len(),
            compiled = kernels.len(),
            fallback = fallback.len(),
            "graph compiled"
        );
        Ok(CompiledGraph {
            outcome,
            kernels,
            fallback,
        })
    }

    /// Drops cached plans compiled before the last engine reset.
    pub fn sweep_invalidated(&self) -> usize {
        self.cache
            .keys()
            .iter()
            .filter(|key| self.cache.remove_if_invalidated(key))
            .count()
    }
}
