//! Metrics for the content cache and its persistence.
//!
//! Counters track hits, misses, evictions by reason and absorbed errors by
//! kind; histograms track lookup and snapshot timings.
//!
//! ```rust
//! use chunkcull::metrics::CacheMetrics;
//! use std::time::Duration;
//!
//! let metrics = CacheMetrics::new();
//! metrics.record_lookup(true, Duration::from_micros(3));
//! metrics.record_lookup(false, Duration::from_micros(2));
//! assert_eq!(metrics.snapshot().hit_rate(), 0.5);
//! ```

mod counters;
mod histograms;

pub use counters::{Counter, LabeledCounter};
pub use histograms::{Histogram, HistogramSnapshot, LOOKUP_BUCKETS, SNAPSHOT_BUCKETS};

use crate::types::EvictionReason;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Error kinds recorded by [`CacheMetrics::record_error`].
pub const ERROR_PERSISTENCE_READ: &str = "persistence_read";
pub const ERROR_PERSISTENCE_WRITE: &str = "persistence_write";
pub const ERROR_LISTENER: &str = "listener";

/// Metrics owned by a content cache instance.
#[derive(Debug)]
pub struct CacheMetrics {
    /// Lookups that returned a live entry.
    pub hits: Counter,
    /// Lookups that found nothing or an expired entry.
    pub misses: Counter,
    /// Time spent per lookup.
    pub lookup_latency: Histogram,
    /// Removed entries by reason.
    pub evictions: LabeledCounter<1>,
    /// Absorbed errors by kind.
    pub errors: LabeledCounter<1>,
    /// Snapshots written.
    pub snapshots_saved: Counter,
    /// Snapshots hydrated at startup.
    pub snapshots_loaded: Counter,
    /// Snapshot encode + write time.
    pub snapshot_duration: Histogram,
    last_snapshot_bytes: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self {
            hits: Counter::new("chunk_cache_hits"),
            misses: Counter::new("chunk_cache_misses"),
            lookup_latency: Histogram::with_buckets("chunk_cache_lookup_seconds", LOOKUP_BUCKETS),
            evictions: LabeledCounter::new("chunk_cache_evictions", ["reason"]),
            errors: LabeledCounter::new("chunk_cache_errors", ["kind"]),
            snapshots_saved: Counter::new("chunk_cache_snapshots_saved"),
            snapshots_loaded: Counter::new("chunk_cache_snapshots_loaded"),
            snapshot_duration: Histogram::with_buckets(
                "chunk_cache_snapshot_seconds",
                SNAPSHOT_BUCKETS,
            ),
            last_snapshot_bytes: AtomicU64::new(0),
        }
    }

    /// Record a cache lookup.
    pub fn record_lookup(&self, hit: bool, latency: Duration) {
        if hit {
            self.hits.inc();
        } else {
            self.misses.inc();
        }
        self.lookup_latency.observe_duration(latency);
    }

    /// Record entries removed by a sweep phase.
    pub fn record_evictions(&self, reason: EvictionReason, count: usize) {
        if count > 0 {
            self.evictions.inc_by([reason.as_str()], count as u64);
        }
    }

    /// Record an absorbed error.
    pub fn record_error(&self, kind: &str) {
        self.errors.inc([kind]);
    }

    /// Record a completed snapshot save.
    pub fn record_snapshot_saved(&self, duration: Duration, bytes: usize) {
        self.snapshots_saved.inc();
        self.snapshot_duration.observe_duration(duration);
        self.last_snapshot_bytes.store(bytes as u64, Ordering::Relaxed);
    }

    /// Size of the last written snapshot record.
    pub fn last_snapshot_bytes(&self) -> u64 {
        self.last_snapshot_bytes.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.get(),
            misses: self.misses.get(),
            expired: self.evictions.get([EvictionReason::Expired.as_str()]),
            evicted_capacity: self.evictions.get([EvictionReason::Capacity.as_str()]),
            evicted_memory: self.evictions.get([EvictionReason::Memory.as_str()]),
            errors: self.errors.total(),
            snapshots_saved: self.snapshots_saved.get(),
            snapshots_loaded: self.snapshots_loaded.get(),
            lookup_latency: self.lookup_latency.snapshot(),
        }
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`CacheMetrics`].
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub evicted_capacity: u64,
    pub evicted_memory: u64,
    pub errors: u64,
    pub snapshots_saved: u64,
    pub snapshots_loaded: u64,
    pub lookup_latency: HistogramSnapshot,
}

impl MetricsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
