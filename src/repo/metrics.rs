//! Repository Metrics
//!
//! Counters for entry lifecycle transitions, shared by every shard.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Repository metrics collector
#[derive(Debug, Default)]
pub struct RepoMetrics {
    entries_created: AtomicU64,
    cache_hits: AtomicU64,
    builds_succeeded: AtomicU64,
    builds_failed: AtomicU64,
    builds_cancelled: AtomicU64,
    revivals: AtomicU64,
    teardowns: AtomicU64,
    forced_teardowns: AtomicU64,
    // Entries currently present in some shard map
    live_entries: AtomicU64,
}

impl RepoMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_entry_created(&self) {
        self.entries_created.fetch_add(1, Ordering::Relaxed);
        self.live_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_entry_removed(&self) {
        self.live_entries.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_build_succeeded(&self) {
        self.builds_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_build_failed(&self) {
        self.builds_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_build_cancelled(&self) {
        self.builds_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_revival(&self) {
        self.revivals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_teardown(&self, forced: bool) {
        self.teardowns.fetch_add(1, Ordering::Relaxed);
        if forced {
            self.forced_teardowns.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn entries_created(&self) -> u64 {
        self.entries_created.load(Ordering::Relaxed)
    }

    pub fn live_entries(&self) -> u64 {
        self.live_entries.load(Ordering::Relaxed)
    }

    pub fn teardowns(&self) -> u64 {
        self.teardowns.load(Ordering::Relaxed)
    }

    /// Fraction of lookups served by an existing entry.
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed) as f64;
        let total = hits + self.entries_created() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            entries_created: self.entries_created(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            builds_succeeded: self.builds_succeeded.load(Ordering::Relaxed),
            builds_failed: self.builds_failed.load(Ordering::Relaxed),
            builds_cancelled: self.builds_cancelled.load(Ordering::Relaxed),
            revivals: self.revivals.load(Ordering::Relaxed),
            teardowns: self.teardowns(),
            forced_teardowns: self.forced_teardowns.load(Ordering::Relaxed),
            live_entries: self.live_entries(),
            hit_ratio: self.hit_ratio(),
        }
    }
}

/// Point-in-time copy of [`RepoMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub entries_created: u64,
    pub cache_hits: u64,
    pub builds_succeeded: u64,
    pub builds_failed: u64,
    pub builds_cancelled: u64,
    pub revivals: u64,
    pub teardowns: u64,
    pub forced_teardowns: u64,
    pub live_entries: u64,
    pub hit_ratio: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_entries_gauge() {
        let metrics = RepoMetrics::new();
        metrics.record_entry_created();
        metrics.record_entry_created();
        metrics.record_entry_removed();

        assert_eq!(metrics.entries_created(), 2);
        assert_eq!(metrics.live_entries(), 1);
    }

    #[test]
    fn test_hit_ratio() {
        let metrics = RepoMetrics::new();
        assert_eq!(metrics.hit_ratio(), 0.0);

        metrics.record_entry_created();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        assert!((metrics.hit_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_counts_forced_teardowns() {
        let metrics = RepoMetrics::new();
        metrics.record_teardown(false);
        metrics.record_teardown(true);
        metrics.record_revival();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.teardowns, 2);
        assert_eq!(snapshot.forced_teardowns, 1);
        assert_eq!(snapshot.revivals, 1);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["teardowns"], 2);
    }
}
