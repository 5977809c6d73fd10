//! Pipeline counters and the metrics snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use storage::CacheStats;

use crate::pool::PoolStats;

/// Lifetime request counters of a pipeline.
#[derive(Debug, Default)]
pub(crate) struct PipelineCounters {
    pub requests: AtomicU64,
    pub image_hits: AtomicU64,
    pub series_hits: AtomicU64,
    pub aggregations: AtomicU64,
    pub renders: AtomicU64,
    pub failures: AtomicU64,
}

impl PipelineCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Process memory plus pipeline request counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    /// Resident set size of this process, 0 where unavailable.
    pub rss_bytes: u64,
    pub requests: u64,
    pub image_hits: u64,
    pub series_hits: u64,
    pub aggregations: u64,
    pub renders: u64,
    pub failures: u64,
}

impl MemoryStats {
    pub(crate) fn read(counters: &PipelineCounters) -> Self {
        Self {
            rss_bytes: read_rss_bytes(),
            requests: counters.requests.load(Ordering::Relaxed),
            image_hits: counters.image_hits.load(Ordering::Relaxed),
            series_hits: counters.series_hits.load(Ordering::Relaxed),
            aggregations: counters.aggregations.load(Ordering::Relaxed),
            renders: counters.renders.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
        }
    }
}

/// Everything `metrics()` reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineMetrics {
    pub cache: CacheStats,
    pub pool: PoolStats,
    pub memory: MemoryStats,
}

/// Resident set size from `/proc/self/status` (Linux only).
pub fn read_rss_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| parse_vm_rss(&status))
        .unwrap_or(0)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}
