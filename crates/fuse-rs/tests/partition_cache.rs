use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use fuse_rs::compile::{
    compile_partition, is_cached, CacheConfig, CacheError, CompileError, CompiledPartitionCache,
    EngineProbe, FailurePolicy, KeyChange, PartitionCompiler, PartitionKey,
};
use fuse_rs::fusion::{FusionConfig, FusionManager, Partition};
use fuse_rs::graph::{DType, GraphBuilder, Layout, LogicalTensor, OpKind};
use fuse_rs::passes::register_standard_patterns;
use fuse_rs::pattern::PatternRegistry;

fn key(n: u64) -> PartitionKey {
    PartitionKey {
        backend_hash: 1,
        structure_hash: n,
        dtype_hash: 0,
        shape_hash: 0,
        layout_hash: 0,
        hash: n,
    }
}

fn ok(value: u32) -> impl FnOnce() -> Result<u32, CompileError> {
    move || Ok(value)
}

#[test]
fn hit_returns_the_cached_artifact() {
    let cache = CompiledPartitionCache::new(4);
    let first = cache.get_or_add(key(1), ok(7));
    let second = cache.get_or_add(key(1), || panic!("compiled twice"));
    assert!(first.same_entry(&second));
    assert_eq!(*second.artifact().expect("artifact"), 7);
    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses), (1, 1));
    assert_eq!(cache.get_size(), 1);
}

#[test]
fn least_recently_used_entry_is_evicted() {
    let cache = CompiledPartitionCache::new(2);
    cache.get_or_add(key(1), ok(1));
    cache.get_or_add(key(2), ok(2));
    // Touch key 1 so key 2 becomes the eviction victim.
    assert!(cache.get(&key(1)).is_some());
    cache.get_or_add(key(3), ok(3));

    assert_eq!(cache.get_size(), 2);
    assert!(cache.contains(&key(1)));
    assert!(!cache.contains(&key(2)));
    assert!(cache.contains(&key(3)));
    assert_eq!(cache.stats().evictions, 1);
}

#[test]
fn capacity_changes_evict_and_reject_negative_values() {
    let cache = CompiledPartitionCache::new(4);
    for n in 0..4 {
        cache.get_or_add(key(n), ok(n as u32));
    }
    assert_eq!(cache.set_capacity(-3), Err(CacheError::InvalidCapacity(-3)));
    assert_eq!(cache.get_capacity(), 4);

    cache.set_capacity(1).expect("shrink");
    assert_eq!(cache.get_capacity(), 1);
    assert_eq!(cache.get_size(), 1);
    assert!(cache.contains(&key(3)));
    assert_eq!(cache.stats().evictions, 3);

    cache.set_capacity(8).expect("grow");
    assert_eq!(cache.get_size(), 1);
}

#[test]
fn inserting_while_another_key_compiles_stays_within_capacity() {
    let cache = CompiledPartitionCache::new(1);
    let outer = cache.get_or_add(key(1), || {
        let inner = cache.get_or_add(key(2), ok(2));
        assert_eq!(*inner.artifact().expect("inner"), 2);
        assert_eq!(cache.get_size(), 1);
        Ok(1)
    });

    assert_eq!(*outer.artifact().expect("outer"), 1);
    assert_eq!(cache.get_size(), 1);
    assert!(cache.contains(&key(2)));
    assert!(!cache.contains(&key(1)));
    assert_eq!(cache.stats().evictions, 1);
}

#[test]
fn zero_capacity_compiles_without_storing() {
    let cache = CompiledPartitionCache::new(0);
    let compiles = AtomicUsize::new(0);
    for _ in 0..3 {
        let handle = cache.get_or_add(key(1), || {
            compiles.fetch_add(1, Ordering::SeqCst);
            Ok(5u32)
        });
        assert_eq!(*handle.artifact().expect("artifact"), 5);
    }
    assert_eq!(compiles.load(Ordering::SeqCst), 3);
    assert_eq!(cache.get_size(), 0);
    assert!(cache.get(&key(1)).is_none());
}

fn failing() -> Result<u32, CompileError> {
    Err(CompileError::Backend("no kernel".to_string()))
}

#[test]
fn failures_are_evicted_by_default() {
    let cache: CompiledPartitionCache<u32> = CompiledPartitionCache::new(4);
    assert_eq!(cache.failure_policy(), FailurePolicy::Evict);

    let handle = cache.get_or_add(key(1), failing);
    assert_eq!(
        handle.artifact().unwrap_err(),
        CompileError::Backend("no kernel".to_string())
    );
    assert!(!cache.contains(&key(1)));

    let retried = cache.get_or_add(key(1), ok(9));
    assert_eq!(*retried.artifact().expect("retry"), 9);
    assert_eq!(cache.stats().failures, 1);
}

#[test]
fn failures_can_be_cached() {
    let cache: CompiledPartitionCache<u32> = CompiledPartitionCache::with_config(CacheConfig {
        capacity: 4,
        failure_policy: FailurePolicy::Cache,
    });
    cache.get_or_add(key(1), failing);
    assert!(cache.contains(&key(1)));
    let again = cache.get_or_add(key(1), || panic!("failed compile retried"));
    assert!(again.artifact().is_err());
    assert_eq!(cache.stats().failures, 1);
    assert_eq!(cache.stats().hits, 1);
}

#[test]
fn panicking_compile_becomes_an_error() {
    let cache: CompiledPartitionCache<u32> = CompiledPartitionCache::new(4);
    let handle = cache.get_or_add(key(1), || panic!("kernel generator exploded"));
    assert_eq!(
        handle.artifact().unwrap_err(),
        CompileError::Panicked("kernel generator exploded".to_string())
    );
    // The cache stays usable afterwards.
    assert_eq!(*cache.get_or_add(key(2), ok(1)).artifact().expect("artifact"), 1);
}

#[test]
fn update_entry_replaces_only_existing_keys() {
    let cache = CompiledPartitionCache::new(4);
    assert!(!cache.update_entry(&key(1), Ok(1u32)));
    cache.get_or_add(key(1), ok(1));
    assert!(cache.update_entry(&key(1), Ok(2)));
    let handle = cache.get(&key(1)).expect("entry");
    assert_eq!(*handle.artifact().expect("artifact"), 2);
    assert_eq!(cache.get_size(), 1);
}

#[derive(Default)]
struct Generation(AtomicU64);

impl EngineProbe for Generation {
    fn generation(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[test]
fn stale_generations_are_removed() {
    let probe = Arc::new(Generation::default());
    let cache = CompiledPartitionCache::new(4).with_probe(probe.clone());
    cache.get_or_add(key(1), ok(1u32));
    assert!(!cache.remove_if_invalidated(&key(1)));

    probe.0.store(1, Ordering::SeqCst);
    cache.get_or_add(key(2), ok(2));
    assert!(cache.remove_if_invalidated(&key(1)));
    assert!(!cache.remove_if_invalidated(&key(2)));
    assert!(!cache.remove_if_invalidated(&key(3)));
    assert_eq!(cache.keys(), vec![key(2)]);
    assert_eq!(cache.stats().invalidations, 1);
}

#[test]
fn without_a_probe_nothing_is_invalidated() {
    let cache = CompiledPartitionCache::new(4);
    cache.get_or_add(key(1), ok(1u32));
    assert!(!cache.remove_if_invalidated(&key(1)));
    assert!(cache.remove(&key(1)));
    assert!(!cache.remove(&key(1)));
    cache.get_or_add(key(2), ok(2));
    cache.clear();
    assert_eq!(cache.get_size(), 0);
}

/// Counts compiles and returns the number of ops in the partition.
#[derive(Default)]
struct CountingCompiler {
    compiles: AtomicUsize,
}

impl PartitionCompiler for CountingCompiler {
    type Artifact = usize;

    fn backend_name(&self) -> &str {
        "cpu"
    }

    fn compile(
        &self,
        partition: &Partition,
        _inputs: &[LogicalTensor],
        _outputs: &[LogicalTensor],
    ) -> Result<usize, CompileError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        Ok(partition.len())
    }
}

fn eltwise_partition() -> Partition {
    let mut builder = PatternRegistry::builder();
    register_standard_patterns(&mut builder, "cpu").expect("patterns");
    let registry = builder.freeze();

    let mut g = GraphBuilder::new();
    let x = g.input(DType::F32, [4, 8]).expect("x");
    let y = g.input(DType::F32, [4, 8]).expect("y");
    let relu = g.op(OpKind::ReLU, &[x], DType::F32, [4, 8]).expect("relu");
    g.op(OpKind::Add, &[relu, y], DType::F32, [4, 8]).expect("add");
    let graph = g.finish();
    let mut partitions = FusionManager::new(&registry, &["cpu"], FusionConfig::default())
        .apply_patterns(&graph);
    assert_eq!(partitions.len(), 1);
    partitions.remove(0)
}

#[test]
fn compile_partition_compiles_once_per_descriptor_set() {
    let partition = eltwise_partition();
    let compiler = CountingCompiler::default();
    let cache = CompiledPartitionCache::new(8);
    let inputs = partition.inputs().to_vec();
    let outputs = partition.outputs().to_vec();

    assert!(!is_cached(&cache, &compiler, &partition, &inputs, &outputs).expect("key"));
    let plan = compile_partition(&cache, &compiler, &partition, &inputs, &outputs)
        .expect("key")
        .artifact()
        .expect("compile");
    assert_eq!(*plan, 2);
    assert!(is_cached(&cache, &compiler, &partition, &inputs, &outputs).expect("key"));
    compile_partition(&cache, &compiler, &partition, &inputs, &outputs).expect("key");
    assert_eq!(compiler.compiles.load(Ordering::SeqCst), 1);

    let wider: Vec<LogicalTensor> = inputs
        .iter()
        .map(|tensor| LogicalTensor::new(tensor.id, tensor.dtype, [16, 8]))
        .collect();
    compile_partition(&cache, &compiler, &partition, &wider, &outputs).expect("key");
    assert_eq!(compiler.compiles.load(Ordering::SeqCst), 2);
    assert_eq!(cache.get_size(), 2);
}

#[test]
fn key_changes_are_classified() {
    let partition = eltwise_partition();
    let inputs = partition.inputs().to_vec();
    let outputs = partition.outputs().to_vec();
    let base = PartitionKey::new("cpu", &partition, &inputs, &outputs).expect("key");

    assert_eq!(base.classify_change_from(None), KeyChange::FirstSeen);
    let same = PartitionKey::new("cpu", &partition, &inputs, &outputs).expect("key");
    assert_eq!(same, base);
    assert_eq!(same.classify_change_from(Some(&base)), KeyChange::Identical);

    let other_backend = PartitionKey::new("gpu", &partition, &inputs, &outputs).expect("key");
    assert_eq!(other_backend.classify_change_from(Some(&base)), KeyChange::Backend);

    let half: Vec<LogicalTensor> = inputs
        .iter()
        .map(|tensor| LogicalTensor {
            dtype: DType::F16,
            ..tensor.clone()
        })
        .collect();
    let dtype_key = PartitionKey::new("cpu", &partition, &half, &outputs).expect("key");
    assert_eq!(dtype_key.classify_change_from(Some(&base)), KeyChange::DType);

    let reshaped: Vec<LogicalTensor> = inputs
        .iter()
        .map(|tensor| LogicalTensor::strided(tensor.id, tensor.dtype, [8, 4]))
        .collect();
    let shape_key = PartitionKey::new("cpu", &partition, &reshaped, &outputs).expect("key");
    assert_eq!(shape_key.classify_change_from(Some(&base)), KeyChange::Shape);

    let transposed: Vec<LogicalTensor> = inputs
        .iter()
        .map(|tensor| tensor.clone().with_layout(Layout::Strided(vec![1, 4])))
        .collect();
    let layout_key = PartitionKey::new("cpu", &partition, &transposed, &outputs).expect("key");
    assert_eq!(layout_key.classify_change_from(Some(&base)), KeyChange::Layout);
    assert_eq!(KeyChange::Layout.as_str(), "layout");
}
