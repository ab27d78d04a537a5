//! Buffer pool statistics tracking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics tracked by one pool instance.
///
/// All fields are atomic for lock-free, thread-safe updates; counters
/// are eventually consistent and use `Ordering::Relaxed` throughout.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Page requests satisfied from the pool.
    pub hits: AtomicU64,

    /// Page requests that had to read from disk.
    pub misses: AtomicU64,

    /// Pages evicted to make room.
    pub evictions: AtomicU64,

    /// Page images read from disk.
    pub pages_read: AtomicU64,

    /// Page images written back to disk.
    pub pages_written: AtomicU64,

    /// Old-segment pages promoted to the LRU head.
    pub made_young: AtomicU64,

    /// Old-segment hits left in place by the too-old test.
    pub not_made_young: AtomicU64,

    /// Descriptors moved to a different block (compressed-page
    /// materialization, frame reclaim, shrink).
    pub relocations: AtomicU64,

    /// Blocks inspected by eviction tail scans.
    pub eviction_scanned: AtomicU64,
}

impl PoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache hit rate in 0.0..=1.0.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Non-atomic copy for display/logging.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            pages_read: self.pages_read.load(Ordering::Relaxed),
            pages_written: self.pages_written.load(Ordering::Relaxed),
            made_young: self.made_young.load(Ordering::Relaxed),
            not_made_young: self.not_made_young.load(Ordering::Relaxed),
            relocations: self.relocations.load(Ordering::Relaxed),
            eviction_scanned: self.eviction_scanned.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A point-in-time, addable snapshot of pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub pages_read: u64,
    pub pages_written: u64,
    pub made_young: u64,
    pub not_made_young: u64,
    pub relocations: u64,
    pub eviction_scanned: u64,
}

impl StatsSnapshot {
    /// Cache hit rate in 0.0..=1.0.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Combine per-instance snapshots into a pool-wide one.
    pub fn merge(&self, other: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits + other.hits,
            misses: self.misses + other.misses,
            evictions: self.evictions + other.evictions,
            pages_read: self.pages_read + other.pages_read,
            pages_written: self.pages_written + other.pages_written,
            made_young: self.made_young + other.made_young,
            not_made_young: self.not_made_young + other.not_made_young,
            relocations: self.relocations + other.relocations,
            eviction_scanned: self.eviction_scanned + other.eviction_scanned,
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Stats {{ hits: {}, misses: {}, evictions: {}, young: {}/{}, hit_rate: {:.2}% }}",
            self.hits,
            self.misses,
            self.evictions,
            self.made_young,
            self.made_young + self.not_made_young,
            self.hit_rate() * 100.0
        )
    }
}
