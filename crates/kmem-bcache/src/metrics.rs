//! Cache counters.
//!
//! Relaxed atomic counters on the hot paths, snapshotted into a plain
//! serializable struct for reporting.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by the cache.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Requests satisfied by a resident buffer.
    hits: AtomicU64,
    /// Requests that recycled an unreferenced buffer in the home bucket.
    recycles: AtomicU64,
    /// Requests that stole an unreferenced buffer from another bucket.
    steals: AtomicU64,
    /// Device reads performed to fill an invalid payload.
    fills: AtomicU64,
    /// Thefts abandoned because the identity appeared concurrently while
    /// no bucket lock was held.
    steal_races: AtomicU64,
}

impl CacheMetrics {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recycle(&self) {
        self.recycles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_steal(&self) {
        self.steals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fill(&self) {
        self.fills.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_steal_race(&self) {
        self.steal_races.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the counters for reporting.
    #[must_use]
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            recycles: self.recycles.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
            fills: self.fills.load(Ordering::Relaxed),
            steal_races: self.steal_races.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of [`CacheMetrics`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub recycles: u64,
    pub steals: u64,
    pub fills: u64,
    pub steal_races: u64,
}

impl CacheMetricsSnapshot {
    /// Fraction of requests served without repurposing a buffer.
    #[must_use]
    #[expect(clippy::cast_precision_loss)] // reporting only
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.recycles + self.steals;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}
