//! Per-list allocator counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters for one free list.
#[derive(Debug, Default)]
pub struct ListMetrics {
    /// Pages this list handed out (including pages stolen from it).
    allocs: AtomicU64,
    /// Pages returned to this list.
    frees: AtomicU64,
    /// Allocations this list satisfied by stealing from another.
    stolen_to: AtomicU64,
    /// Pages another list's allocation took from this one.
    stolen_from: AtomicU64,
}

impl ListMetrics {
    pub(crate) fn record_alloc(&self) {
        self.allocs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_free(&self) {
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stolen_to(&self) {
        self.stolen_to.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stolen_from(&self) {
        self.stolen_from.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the counters for reporting.
    #[must_use]
    pub fn snapshot(&self) -> ListMetricsSnapshot {
        ListMetricsSnapshot {
            allocs: self.allocs.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            stolen_to: self.stolen_to.load(Ordering::Relaxed),
            stolen_from: self.stolen_from.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of one list's [`ListMetrics`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ListMetricsSnapshot {
    pub allocs: u64,
    pub frees: u64,
    pub stolen_to: u64,
    pub stolen_from: u64,
}

/// Aggregated snapshot across all free lists.
#[derive(Debug, Clone, Serialize)]
pub struct AllocatorMetricsSnapshot {
    pub per_list: Vec<ListMetricsSnapshot>,
    pub total_allocs: u64,
    pub total_frees: u64,
    pub total_steals: u64,
}

impl AllocatorMetricsSnapshot {
    pub(crate) fn from_lists(per_list: Vec<ListMetricsSnapshot>) -> Self {
        let total_allocs = per_list.iter().map(|l| l.allocs).sum();
        let total_frees = per_list.iter().map(|l| l.frees).sum();
        let total_steals = per_list.iter().map(|l| l.stolen_to).sum();
        Self {
            per_list,
            total_allocs,
            total_frees,
            total_steals,
        }
    }
}
