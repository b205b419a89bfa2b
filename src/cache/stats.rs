//! Cache Statistics Module
//!
//! Tracks cache performance metrics including hits, misses, and evictions.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::cache::EvictionReason;

// == Cache Stats ==
/// Point-in-time snapshot of cache performance metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Number of successful cache retrievals
    pub hits: u64,
    /// Number of failed cache retrievals (key not found or expired)
    pub misses: u64,
    /// Evictions broken down by reason
    pub evictions: EvictionStats,
    /// Current number of entries in the cache
    pub total_entries: usize,
}

/// Eviction counters, one per terminal reason.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvictionStats {
    pub removed: u64,
    pub replaced: u64,
    pub expired: u64,
    pub token_expired: u64,
    pub capacity: u64,
}

impl EvictionStats {
    /// Total number of evictions across all reasons.
    pub fn total(&self) -> u64 {
        self.removed + self.replaced + self.expired + self.token_expired + self.capacity
    }
}

impl CacheStats {
    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no requests have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// == Stats Recorder ==
/// Lock-free counters updated by the engine.
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
    removed: AtomicU64,
    replaced: AtomicU64,
    expired: AtomicU64,
    token_expired: AtomicU64,
    capacity: AtomicU64,
}

impl StatsRecorder {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self, reason: EvictionReason) {
        let counter = match reason {
            EvictionReason::None => return,
            EvictionReason::Removed => &self.removed,
            EvictionReason::Replaced => &self.replaced,
            EvictionReason::Expired => &self.expired,
            EvictionReason::TokenExpired => &self.token_expired,
            EvictionReason::Capacity => &self.capacity,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, total_entries: usize) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: EvictionStats {
                removed: self.removed.load(Ordering::Relaxed),
                replaced: self.replaced.load(Ordering::Relaxed),
                expired: self.expired.load(Ordering::Relaxed),
                token_expired: self.token_expired.load(Ordering::Relaxed),
                capacity: self.capacity.load(Ordering::Relaxed),
            },
            total_entries,
        }
    }
}
