//! Process-shareable cache of compiled partitions.
//!
//! Lookups take a read lock and only touch an atomic timestamp. A miss
//! inserts a pending entry under the write lock and runs the compile outside
//! of it, so concurrent requests for the same key wait on that entry's cell
//! instead of compiling again.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compile::{CompileError, EngineProbe, PartitionKey};
use crate::env;
use crate::profiling;

pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

pub type CompileResult<A> = Result<Arc<A>, CompileError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache capacity must be non-negative, got {0}")]
    InvalidCapacity(i64),
}

/// What to do with an entry whose compile failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep the failure so later lookups return it without recompiling.
    Cache,
    /// Drop the entry once the failure is delivered; the next lookup retries.
    #[default]
    Evict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub failure_policy: FailurePolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl CacheConfig {
    /// Defaults overridden by `FUSE_RS_PARTITION_CACHE_CAPACITY` and
    /// `FUSE_RS_CACHE_FAILED_COMPILES`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(capacity) = env::env_usize(env::CACHE_CAPACITY_VAR) {
            config.capacity = capacity;
        }
        if env::env_bool(env::CACHE_FAILED_COMPILES_VAR).unwrap_or(false) {
            config.failure_policy = FailurePolicy::Cache;
        }
        config
    }
}

struct CacheEntry<A> {
    result: OnceCell<CompileResult<A>>,
    last_used: AtomicU64,
    inserted: u64,
    generation: u64,
}

impl<A> CacheEntry<A> {
    fn pending(stamp: u64, generation: u64) -> Self {
        Self {
            result: OnceCell::new(),
            last_used: AtomicU64::new(stamp),
            inserted: stamp,
            generation,
        }
    }

    fn ready(result: CompileResult<A>, stamp: u64, inserted: u64, generation: u64) -> Self {
        Self {
            result: OnceCell::with_value(result),
            last_used: AtomicU64::new(stamp),
            inserted,
            generation,
        }
    }

    fn is_ready(&self) -> bool {
        self.result.get().is_some()
    }
}

/// Handle on a cache entry; the result may still be compiling.
pub struct SharedResult<A> {
    entry: Arc<CacheEntry<A>>,
}

impl<A> Clone for SharedResult<A> {
    fn clone(&self) -> Self {
        Self {
            entry: Arc::clone(&self.entry),
        }
    }
}

impl<A> SharedResult<A> {
    /// Blocks until the compile behind this entry finished.
    pub fn wait(&self) -> &CompileResult<A> {
        self.entry.result.wait()
    }

    pub fn try_get(&self) -> Option<&CompileResult<A>> {
        self.entry.result.get()
    }

    pub fn is_ready(&self) -> bool {
        self.entry.is_ready()
    }

    /// Waits and clones the outcome.
    pub fn artifact(&self) -> CompileResult<A> {
        self.wait().clone()
    }

    /// Whether both handles observe the same cache entry.
    pub fn same_entry(&self, other: &SharedResult<A>) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }
}

impl<A> fmt::Debug for SharedResult<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedResult")
            .field("ready", &self.is_ready())
            .field("generation", &self.entry.generation)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// LRU cache of compile results keyed by [`PartitionKey`].
pub struct CompiledPartitionCache<A> {
    entries: RwLock<HashMap<PartitionKey, Arc<CacheEntry<A>>>>,
    capacity: AtomicUsize,
    clock: AtomicU64,
    failure_policy: FailurePolicy,
    probe: Option<Arc<dyn EngineProbe>>,
    counters: Counters,
}

impl<A: Send + Sync + 'static> CompiledPartitionCache<A> {
    pub fn new(capacity: usize) -> Self {
        Self::with_config(CacheConfig {
            capacity,
            ..CacheConfig::default()
        })
    }

    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: AtomicUsize::new(config.capacity),
            clock: AtomicU64::new(0),
            failure_policy: config.failure_policy,
            probe: None,
            counters: Counters::default(),
        }
    }

    /// Attaches the engine whose generation entries are checked against.
    pub fn with_probe(mut self, probe: Arc<dyn EngineProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Returns the entry for `key`, running `compile` only if no entry exists.
    ///
    /// Exactly one caller per key runs `compile`; everyone else receives a
    /// handle on the same entry and may block on [`SharedResult::wait`].
    pub fn get_or_add<F>(&self, key: PartitionKey, compile: F) -> SharedResult<A>
    where
        F: FnOnce() -> Result<A, CompileError>,
    {
        if self.get_capacity() == 0 {
            let result = run_compile(compile);
            if result.is_err() {
                Counters::bump(&self.counters.failures);
            }
            let stamp = self.tick();
            return SharedResult {
                entry: Arc::new(CacheEntry::ready(result, stamp, stamp, self.generation())),
            };
        }

        if let Some(hit) = self.lookup(&key) {
            return hit;
        }

        let entry = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = entries.get(&key) {
                existing.last_used.store(self.tick(), Ordering::Relaxed);
                Counters::bump(&self.counters.hits);
                profiling::cache_event("partition_cache_hit");
                return SharedResult {
                    entry: Arc::clone(existing),
                };
            }
            Counters::bump(&self.counters.misses);
            profiling::cache_event("partition_cache_miss");
            let capacity = self.get_capacity();
            self.evict_to(&mut entries, capacity.saturating_sub(1));
            let entry = Arc::new(CacheEntry::pending(self.tick(), self.generation()));
            entries.insert(key, Arc::clone(&entry));
            entry
        };

        let result = {
            let _scope = profiling::compile_scope("partition_compile");
            run_compile(compile)
        };
        let failed = result.is_err();
        if let Err(err) = &result {
            Counters::bump(&self.counters.failures);
            tracing::warn!(key = key.hash, policy = ?self.failure_policy, "partition compile failed: {err}");
        }
        // Only this thread initializes a pending entry.
        let _ = entry.result.set(result);

        if failed && self.failure_policy == FailurePolicy::Evict {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            if entries
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, &entry))
            {
                entries.remove(&key);
            }
        }
        SharedResult { entry }
    }

    /// Returns the entry for `key` if present, refreshing its recency.
    pub fn get(&self, key: &PartitionKey) -> Option<SharedResult<A>> {
        self.lookup(key)
    }

    pub fn contains(&self, key: &PartitionKey) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Replaces the entry for `key` with a finished result. Returns false if
    /// the key is not cached.
    pub fn update_entry(&self, key: &PartitionKey, result: Result<A, CompileError>) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let Some(current) = entries.get(key) else {
            return false;
        };
        let inserted = current.inserted;
        let replacement = CacheEntry::ready(
            result.map(Arc::new),
            self.tick(),
            inserted,
            self.generation(),
        );
        entries.insert(*key, Arc::new(replacement));
        true
    }

    /// Drops the entry for `key` if it was compiled for an older engine generation.
    pub fn remove_if_invalidated(&self, key: &PartitionKey) -> bool {
        let Some(probe) = &self.probe else {
            return false;
        };
        let current = probe.generation();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let stale = entries
            .get(key)
            .is_some_and(|entry| entry.generation != current);
        if stale {
            entries.remove(key);
            Counters::bump(&self.counters.invalidations);
            tracing::debug!(key = key.hash, generation = current, "dropped stale compiled partition");
        }
        stale
    }

    pub fn remove(&self, key: &PartitionKey) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn keys(&self) -> Vec<PartitionKey> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Sets the capacity, evicting least recently used entries beyond it.
    pub fn set_capacity(&self, capacity: i64) -> Result<(), CacheError> {
        let capacity = usize::try_from(capacity).map_err(|_| CacheError::InvalidCapacity(capacity))?;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        self.capacity.store(capacity, Ordering::Relaxed);
        self.evict_to(&mut entries, capacity);
        Ok(())
    }

    pub fn get_capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn get_size(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    fn lookup(&self, key: &PartitionKey) -> Option<SharedResult<A>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(key)?;
        entry.last_used.store(self.tick(), Ordering::Relaxed);
        Counters::bump(&self.counters.hits);
        profiling::cache_event("partition_cache_hit");
        Some(SharedResult {
            entry: Arc::clone(entry),
        })
    }

    /// Evicts least recently used entries until at most `target` remain.
    ///
    /// Finished entries go first. A pending entry is only dropped from the
    /// map; handles already holding it still receive its result.
    fn evict_to(&self, entries: &mut HashMap<PartitionKey, Arc<CacheEntry<A>>>, target: usize) {
        while entries.len() > target {
            let victim = entries
                .iter()
                .min_by_key(|(_, entry)| {
                    (
                        !entry.is_ready(),
                        entry.last_used.load(Ordering::Relaxed),
                        entry.inserted,
                    )
                })
                .map(|(key, _)| *key);
            let Some(victim) = victim else {
                break;
            };
            entries.remove(&victim);
            Counters::bump(&self.counters.evictions);
            profiling::cache_event("partition_cache_evict");
            tracing::trace!(key = victim.hash, "evicted compiled partition");
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn generation(&self) -> u64 {
        self.probe.as_ref().map_or(0, |probe| probe.generation())
    }
}

fn run_compile<A, F>(compile: F) -> CompileResult<A>
where
    F: FnOnce() -> Result<A, CompileError>,
{
    match catch_unwind(AssertUnwindSafe(compile)) {
        Ok(result) => result.map(Arc::new),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|message| message.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            Err(CompileError::Panicked(message))
        }
    }
}
