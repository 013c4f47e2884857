//! Query metrics
//!
//! Counters plus a sliding latency window capped at 1000 samples. Safe for
//! concurrent writers; snapshots are cheap.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

const MAX_SAMPLES: usize = 1000;

#[derive(Default)]
struct Inner {
    total: u64,
    cache_hits: u64,
    cache_misses: u64,
    errors: u64,
    samples: VecDeque<f64>,
}

/// In-process query metrics.
#[derive(Default)]
pub struct QueryMetrics {
    inner: Mutex<Inner>,
}

/// A point-in-time view of the metrics.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub errors: u64,
    pub cache_hit_rate: f64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub sample_count: usize,
}

impl QueryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a completed query.
    pub fn record(&self, latency_ms: f64, cache_hit: bool) {
        let mut inner = self.lock();
        inner.total += 1;
        if cache_hit {
            inner.cache_hits += 1;
        } else {
            inner.cache_misses += 1;
        }
        if inner.samples.len() == MAX_SAMPLES {
            inner.samples.pop_front();
        }
        inner.samples.push_back(latency_ms);
    }

    /// Record a failed query (timeouts included).
    pub fn record_error(&self) {
        let mut inner = self.lock();
        inner.total += 1;
        inner.errors += 1;
    }

    /// Snapshot current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.lock();
        let avg = if inner.samples.is_empty() {
            0.0
        } else {
            inner.samples.iter().sum::<f64>() / inner.samples.len() as f64
        };
        let total = inner.total.max(1) as f64;

        MetricsSnapshot {
            total: inner.total,
            cache_hits: inner.cache_hits,
            cache_misses: inner.cache_misses,
            errors: inner.errors,
            cache_hit_rate: inner.cache_hits as f64 / total,
            error_rate: inner.errors as f64 / total,
            avg_latency_ms: avg,
            sample_count: inner.samples.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_rates() {
        let metrics = QueryMetrics::new();
        metrics.record(100.0, false);
        metrics.record(200.0, true);
        metrics.record_error();

        let snap = metrics.snapshot();
        assert_eq!(snap.total, 3);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.cache_misses, 1);
        assert_eq!(snap.errors, 1);
        assert!((snap.avg_latency_ms - 150.0).abs() < f64::EPSILON);
        assert!((snap.cache_hit_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((snap.error_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn sample_window_is_capped() {
        let metrics = QueryMetrics::new();
        for i in 0..1200 {
            metrics.record(i as f64, false);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.sample_count, 1000);
        assert_eq!(snap.total, 1200);
        // Oldest 200 samples were evicted, so the mean covers 200..1199.
        assert!(snap.avg_latency_ms > 600.0);
    }

    #[test]
    fn empty_snapshot_is_zeroed() {
        let snap = QueryMetrics::new().snapshot();
        assert_eq!(snap.total, 0);
        assert_eq!(snap.avg_latency_ms, 0.0);
    }
}
