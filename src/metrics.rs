//! Hit/miss accounting for the cache store.
//!
//! Counters accumulate for the life of the process and are persisted with
//! the cache index, so they also survive restarts. Only an explicit cache
//! clear resets them.

use serde::{Deserialize, Serialize};

/// Raw counters, persisted alongside the cache index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metrics {
    pub hits: u64,
    pub misses: u64,
    /// Plays served entirely from disk
    pub rewatches: u64,
    pub evictions: u64,
    /// Estimate of transfer avoided, grown by the size of each evicted entry
    pub data_saved_bytes: u64,
    /// Bytes handed out from disk on hits
    pub bytes_served_from_cache: u64,
}

impl Metrics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Owned by the cache store; everything else reads snapshots.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    metrics: Metrics,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_metrics(metrics: Metrics) -> Self {
        Self { metrics }
    }

    pub fn record_hit(&mut self, size_bytes: u64) {
        self.metrics.hits += 1;
        self.metrics.rewatches += 1;
        self.metrics.bytes_served_from_cache += size_bytes;
    }

    pub fn record_miss(&mut self) {
        self.metrics.misses += 1;
    }

    pub fn record_eviction(&mut self, size_bytes: u64) {
        self.metrics.evictions += 1;
        self.metrics.data_saved_bytes += size_bytes;
    }

    pub fn reset(&mut self) {
        self.metrics = Metrics::default();
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics
    }

    pub fn snapshot(&self, entries: usize, capacity: usize, total_bytes: u64) -> CacheMetrics {
        CacheMetrics {
            counters: self.metrics,
            entries,
            capacity,
            total_bytes,
            utilization: if capacity == 0 {
                0.0
            } else {
                entries as f64 / capacity as f64
            },
            hit_rate: self.metrics.hit_rate(),
        }
    }
}

/// Counters plus utilization of the store at the moment of the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheMetrics {
    #[serde(flatten)]
    pub counters: Metrics,
    pub entries: usize,
    pub capacity: usize,
    pub total_bytes: u64,
    /// entries / capacity
    pub utilization: f64,
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hits_count_as_rewatches() {
        let mut collector = MetricsCollector::new();
        collector.record_hit(100);
        collector.record_hit(50);
        collector.record_miss();

        let m = collector.metrics();
        assert_eq!(m.hits, 2);
        assert_eq!(m.rewatches, 2);
        assert_eq!(m.misses, 1);
        assert_eq!(m.bytes_served_from_cache, 150);
        assert!((m.hit_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn eviction_grows_data_saved() {
        let mut collector = MetricsCollector::new();
        collector.record_eviction(1024);
        collector.record_eviction(1024);
        assert_eq!(collector.metrics().data_saved_bytes, 2048);
        assert_eq!(collector.metrics().evictions, 2);

        collector.reset();
        assert_eq!(collector.metrics(), Metrics::default());
    }

    #[test]
    fn snapshot_reports_utilization() {
        let collector = MetricsCollector::new();
        let snapshot = collector.snapshot(4, 16, 4096);
        assert_eq!(snapshot.utilization, 0.25);
        assert_eq!(snapshot.hit_rate, 0.0);
    }
}
