//! Lightweight counters for pattern passes, cache traffic and partition compiles.
//!
//! Everything here compiles to no-ops unless the `profiler` feature is enabled.

#[cfg(feature = "profiler")]
use std::collections::HashMap;
#[cfg(feature = "profiler")]
use std::sync::{Mutex, OnceLock, PoisonError};
#[cfg(feature = "profiler")]
use std::time::Instant;

use serde::Serialize;

#[cfg_attr(not(feature = "profiler"), allow(dead_code))]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
enum ProfilerKey {
    Pass { name: &'static str },
    Compile { name: &'static str },
    Cache { name: &'static str },
}

#[cfg(feature = "profiler")]
impl ProfilerKey {
    fn category(&self) -> &'static str {
        match self {
            ProfilerKey::Pass { .. } => "pass",
            ProfilerKey::Compile { .. } => "compile",
            ProfilerKey::Cache { .. } => "cache",
        }
    }

    fn name(&self) -> &'static str {
        match *self {
            ProfilerKey::Pass { name }
            | ProfilerKey::Compile { name }
            | ProfilerKey::Cache { name } => name,
        }
    }
}

#[cfg_attr(not(feature = "profiler"), allow(dead_code))]
#[derive(Default, Clone, Copy)]
struct Stat {
    calls: u64,
    total_ns: u128,
}

#[cfg(feature = "profiler")]
struct Profiler {
    stats: Mutex<HashMap<ProfilerKey, Stat>>,
}

#[cfg(feature = "profiler")]
impl Profiler {
    fn instance() -> &'static Profiler {
        static PROFILER: OnceLock<Profiler> = OnceLock::new();
        PROFILER.get_or_init(|| Profiler {
            stats: Mutex::new(HashMap::new()),
        })
    }

    fn record(&self, key: ProfilerKey, elapsed_ns: u128) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let stat = stats.entry(key).or_default();
        stat.calls = stat.calls.saturating_add(1);
        stat.total_ns = stat.total_ns.saturating_add(elapsed_ns);
    }

    fn take_stats(&self) -> HashMap<ProfilerKey, Stat> {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *stats)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReportRow {
    pub category: String,
    pub name: String,
    pub calls: u64,
    pub total_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ProfilerReport {
    pub rows: Vec<ReportRow>,
}

impl ProfilerReport {
    pub fn calls(&self, category: &str, name: &str) -> u64 {
        self.rows
            .iter()
            .filter(|row| row.category == category && row.name == name)
            .map(|row| row.calls)
            .sum()
    }
}

/// Records the wall time of a scope when dropped.
#[must_use = "the scope is measured until the guard is dropped"]
pub struct ScopeGuard {
    #[cfg(feature = "profiler")]
    active: Option<(ProfilerKey, Instant)>,
}

impl ScopeGuard {
    #[inline(always)]
    fn new(key: ProfilerKey) -> Self {
        #[cfg(feature = "profiler")]
        {
            ScopeGuard {
                active: Some((key, Instant::now())),
            }
        }
        #[cfg(not(feature = "profiler"))]
        {
            let _ = key;
            ScopeGuard {}
        }
    }
}

#[cfg(feature = "profiler")]
impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if let Some((key, start)) = self.active.take() {
            Profiler::instance().record(key, start.elapsed().as_nanos());
        }
    }
}

#[inline(always)]
pub fn pass_scope(name: &'static str) -> ScopeGuard {
    ScopeGuard::new(ProfilerKey::Pass { name })
}

#[inline(always)]
pub fn compile_scope(name: &'static str) -> ScopeGuard {
    ScopeGuard::new(ProfilerKey::Compile { name })
}

pub fn cache_event(name: &'static str) {
    #[cfg(feature = "profiler")]
    {
        Profiler::instance().record(ProfilerKey::Cache { name }, 0);
    }
    #[cfg(not(feature = "profiler"))]
    {
        let _ = name;
    }
}

#[cfg(feature = "profiler")]
pub fn take_report() -> Option<ProfilerReport> {
    let stats = Profiler::instance().take_stats();
    if stats.is_empty() {
        return None;
    }
    let mut rows: Vec<ReportRow> = stats
        .into_iter()
        .map(|(key, stat)| ReportRow {
            category: key.category().to_string(),
            name: key.name().to_string(),
            calls: stat.calls,
            total_ms: stat.total_ns as f64 / 1.0e6,
        })
        .collect();
    rows.sort_by(|a, b| (&a.category, &a.name).cmp(&(&b.category, &b.name)));
    Some(ProfilerReport { rows })
}

#[cfg(not(feature = "profiler"))]
pub fn take_report() -> Option<ProfilerReport> {
    None
}

pub fn take_report_json() -> Option<String> {
    let report = take_report()?;
    serde_json::to_string(&report).ok()
}

#[cfg(feature = "profiler")]
pub fn reset() {
    Profiler::instance().take_stats();
}

#[cfg(not(feature = "profiler"))]
pub fn reset() {}
