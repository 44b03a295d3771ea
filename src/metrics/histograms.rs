//! Bucketed histogram for lookup and snapshot timings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Buckets (seconds) sized for in-memory cache lookups.
pub const LOOKUP_BUCKETS: &[f64] = &[
    0.000_001, 0.000_005, 0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.005, 0.01,
];

/// Buckets (seconds) sized for snapshot encode + write.
pub const SNAPSHOT_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

/// A cumulative histogram.
#[derive(Debug)]
pub struct Histogram {
    name: &'static str,
    buckets: Vec<f64>,
    bucket_counts: Vec<AtomicU64>,
    // f64 bits
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn with_buckets(name: &'static str, buckets: &[f64]) -> Self {
        let mut buckets = buckets.to_vec();
        buckets.sort_by(|a, b| a.total_cmp(b));
        let bucket_counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();

        Self {
            name,
            buckets,
            bucket_counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);

        let mut current = self.sum.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self
                .sum
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        for (upper, count) in self.buckets.iter().zip(&self.bucket_counts) {
            if value <= *upper {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64());
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts: self
                .bucket_counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            sum: f64::from_bits(self.sum.load(Ordering::Relaxed)),
            count: self.count.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a histogram.
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    pub buckets: Vec<f64>,
    /// Cumulative counts per bucket.
    pub counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
}

impl HistogramSnapshot {
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Upper bound of the first bucket holding the `p` quantile (0.0..=1.0).
    pub fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let target = (p.clamp(0.0, 1.0) * self.count as f64).ceil() as u64;
        self.buckets
            .iter()
            .zip(&self.counts)
            .find(|(_, count)| **count >= target)
            .map(|(upper, _)| *upper)
            .unwrap_or(f64::INFINITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_and_snapshot() {
        let histogram = Histogram::with_buckets("lookup", &[0.1, 0.01, 1.0]);
        histogram.observe(0.005);
        histogram.observe(0.05);
        histogram.observe(0.5);
        histogram.observe(5.0);

        let snap = histogram.snapshot();
        assert_eq!(snap.buckets, vec![0.01, 0.1, 1.0]);
        assert_eq!(snap.counts, vec![1, 2, 3]);
        assert_eq!(snap.count, 4);
        assert!((snap.sum - 5.555).abs() < 1e-9);
        assert_eq!(snap.percentile(0.5), 0.1);
        assert_eq!(snap.percentile(1.0), f64::INFINITY);
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = Histogram::with_buckets("empty", LOOKUP_BUCKETS).snapshot();
        assert_eq!(snap.mean(), 0.0);
        assert_eq!(snap.percentile(0.99), 0.0);
    }
}
