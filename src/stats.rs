//! Counters for the cache write and flush paths.

use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters kept by a [`Cache`](crate::Cache).
#[derive(Debug, Default)]
pub struct CacheStats {
    accepted: AtomicU64,
    staged: AtomicU64,
    overflowed: AtomicU64,
    refused: AtomicU64,
    slides: AtomicU64,
    retired: AtomicU64,
    evicted_buckets: AtomicU64,
    evicted_offsets: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Writes that landed in a bucket.
    pub accepted: u64,
    /// Accepted writes that went through a shard's staging list.
    pub staged: u64,
    /// Writes dropped with `Overflow`.
    pub overflowed: u64,
    /// Writes dropped with `CacheFull`.
    pub refused: u64,
    /// Baseline advances.
    pub slides: u64,
    /// Buckets retired by slides.
    pub retired: u64,
    /// Buckets returned to the free pool.
    pub evicted_buckets: u64,
    /// Offsets handed out by evictions.
    pub evicted_offsets: u64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_accepted(&self, staged: bool) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        if staged {
            self.staged.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_overflow(&self) {
        self.overflowed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refused(&self) {
        self.refused.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_slide(&self, retired: usize) {
        self.slides.fetch_add(1, Ordering::Relaxed);
        self.retired.fetch_add(retired as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self, buckets: usize, offsets: usize) {
        self.evicted_buckets
            .fetch_add(buckets as u64, Ordering::Relaxed);
        self.evicted_offsets
            .fetch_add(offsets as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            staged: self.staged.load(Ordering::Relaxed),
            overflowed: self.overflowed.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            slides: self.slides.load(Ordering::Relaxed),
            retired: self.retired.load(Ordering::Relaxed),
            evicted_buckets: self.evicted_buckets.load(Ordering::Relaxed),
            evicted_offsets: self.evicted_offsets.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// Fraction of accepted writes that were staged (0.0 to 1.0).
    pub fn staged_ratio(&self) -> f64 {
        if self.accepted == 0 {
            0.0
        } else {
            self.staged as f64 / self.accepted as f64
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "Accepted: {} (staged {}), Overflowed: {}, Refused: {}, Slides: {}, Retired: {}, Evicted: {} buckets / {} offsets",
            self.accepted,
            self.staged,
            self.overflowed,
            self.refused,
            self.slides,
            self.retired,
            self.evicted_buckets,
            self.evicted_offsets
        )
    }
}
