//! Cache Statistics Module
//!
//! Tracks cache engine activity: lookups, writes, requeues and pruning.

use serde::Serialize;

// == Cache Stats ==
/// Tracks cache engine metrics.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that returned at least one live entry
    pub hits: u64,
    /// Lookups that returned nothing (absent, expired or failed)
    pub misses: u64,
    /// Rows written by save and bulk save
    pub writes: u64,
    /// Rows removed by delete
    pub deletes: u64,
    /// Operations put back on the queue after a failed attempt
    pub requeues: u64,
    /// Rows removed by pruning
    pub pruned: u64,
    /// Backend reopen and reinitialization count
    pub reopens: u64,
    /// Operations currently waiting in the queue
    pub queued: usize,
}

impl CacheStats {
    // == Constructor ==
    /// Creates a new CacheStats with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no lookups have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_writes(&mut self, count: usize) {
        self.writes += count as u64;
    }

    pub fn record_deletes(&mut self, count: usize) {
        self.deletes += count as u64;
    }

    pub fn record_requeue(&mut self) {
        self.requeues += 1;
    }

    pub fn record_pruned(&mut self, count: usize) {
        self.pruned += count as u64;
    }

    pub fn record_reopen(&mut self) {
        self.reopens += 1;
    }
}
