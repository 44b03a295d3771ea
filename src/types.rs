//! Core types shared across the cache, lifecycle and persistence layers.

use serde::{Deserialize, Serialize};

/// Identifier of a chunk, also its key in the content cache.
pub type ChunkId = String;

/// Observable cache state delivered to status subscribers.
///
/// Derived from the cache on every mutation; delivered only when it differs
/// from the previously delivered snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatusSnapshot {
    /// Number of entries currently stored (expired-but-unswept included).
    pub size: usize,
    /// Configured capacity.
    pub max_size: usize,
    /// Keys in recency order, least recently used first.
    pub keys: Vec<ChunkId>,
}

impl CacheStatusSnapshot {
    /// Fraction of capacity in use (0.0 when capacity is zero).
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            self.size as f64 / self.max_size as f64
        }
    }
}

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionReason {
    /// `now >= expiry`.
    Expired,
    /// Entry count exceeded `max_size`.
    Capacity,
    /// Estimated footprint exceeded the memory limit.
    Memory,
}

impl EvictionReason {
    /// Metric label for this reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::Expired => "expired",
            EvictionReason::Capacity => "capacity",
            EvictionReason::Memory => "memory",
        }
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Number of entries in the cache.
    pub entry_count: usize,
    /// Estimated footprint in bytes.
    pub estimated_bytes: u64,
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Entries removed by expiry.
    pub expired: u64,
    /// Entries removed by the capacity bound.
    pub evicted_capacity: u64,
    /// Entries removed by memory pressure.
    pub evicted_memory: u64,
    /// Absorbed persistence and listener errors.
    pub errors: u64,
}

impl CacheStats {
    /// Cache hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_camel_case() {
        let status = CacheStatusSnapshot {
            size: 2,
            max_size: 5,
            keys: vec!["a".into(), "b".into()],
        };
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, r#"{"size":2,"maxSize":5,"keys":["a","b"]}"#);
        assert!((status.utilization() - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
