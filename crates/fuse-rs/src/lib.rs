//! Pattern-driven graph fusion and partitioning.
//!
//! A [`graph::Graph`] of ops is matched against prioritized
//! [`pattern::PatternGraph`]s registered per backend. Matches are fused or
//! claimed as partitions by [`fusion::FusionManager`]; every leftover op
//! becomes an unsupported singleton. Backends compile partitions through
//! [`compile::PartitionCompiler`], fronted by the thread-safe
//! [`compile::CompiledPartitionCache`].

pub mod compile;
pub mod env;
pub mod fusion;
pub mod graph;
pub mod hashing;
pub mod matcher;
pub mod passes;
pub mod pattern;
pub mod profiling;
mod signature;

pub use linkme;

pub use compile::{
    compile_partition, is_cached, CacheConfig, CompileError, CompiledPartitionCache,
    EngineProbe, FailurePolicy, PartitionCompiler, PartitionKey, SharedResult,
};
pub use fusion::{FusionConfig, FusionManager, FusionOutcome, Partition, PartitionId};
pub use graph::{DType, Graph, GraphBuilder, Layout, LogicalTensor, Op, OpId, OpKind, TensorId};
pub use matcher::{MatchConfig, Matcher, PatternMatch};
pub use pattern::{
    in_edge, BuildError, PatternGraph, PatternGraphBuilder, PatternRegistry, PortMap, Repetition,
};
