use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use lru::LruCache;

use crate::fusion::FusionStats;
use crate::profiling;

/// One applied match, recorded by graph position so structurally identical
/// graphs with different ids can replay it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlannedGroup {
    pub pattern: usize,
    pub members: Vec<usize>,
}

#[derive(Debug, Clone)]
pub(crate) struct PartitionPlan {
    pub groups: Vec<PlannedGroup>,
    pub stats: FusionStats,
}

/// Memo of partition plans keyed by graph signature.
pub(crate) struct PlanCache {
    entries: Mutex<LruCache<u64, Arc<PartitionPlan>>>,
}

impl PlanCache {
    pub(crate) fn new(capacity: usize) -> Option<Self> {
        let capacity = NonZeroUsize::new(capacity)?;
        Some(Self {
            entries: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub(crate) fn get(&self, signature: u64) -> Option<Arc<PartitionPlan>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let plan = entries.get(&signature).cloned();
        profiling::cache_event(if plan.is_some() {
            "plan_cache_hit"
        } else {
            "plan_cache_miss"
        });
        plan
    }

    pub(crate) fn insert(&self, signature: u64, plan: PartitionPlan) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.push(signature, Arc::new(plan)).is_some_and(|(evicted, _)| evicted != signature) {
            profiling::cache_event("plan_cache_evict");
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
