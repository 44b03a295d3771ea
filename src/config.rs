//! Configuration types for chunk loading and the content cache.

use crate::error::{Error, Result};
use crate::visibility::MarginBreakpoint;
use std::time::Duration;

/// Main configuration, grouping every recognised option.
#[derive(Debug, Clone, Default)]
pub struct ChunkCullConfig {
    /// Content cache options.
    pub cache: CacheOptions,

    /// Visibility sensor options.
    pub observer: ObserverOptions,

    /// Load/unload delays.
    pub animations: AnimationOptions,

    /// Retry and timeout policy.
    pub error_handling: ErrorHandlingOptions,

    /// Compression and memory bound.
    pub performance: PerformanceOptions,
}

impl ChunkCullConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cache entry time-to-live.
    pub fn with_cache_duration(mut self, duration: Duration) -> Self {
        self.cache.duration = duration;
        self
    }

    /// Set the maximum number of cached entries.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.cache.max_size = max_size;
        self
    }

    /// Set the periodic sweep interval.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cache.cleanup_interval = interval;
        self
    }

    /// Set persistence options.
    pub fn with_persistence(mut self, persistence: PersistenceOptions) -> Self {
        self.cache.persistence = persistence;
        self
    }

    /// Enable or disable persistence.
    pub fn with_persistence_enabled(mut self, enabled: bool) -> Self {
        self.cache.persistence.enabled = enabled;
        self
    }

    /// Set observer options.
    pub fn with_observer(mut self, observer: ObserverOptions) -> Self {
        self.observer = observer;
        self
    }

    /// Set load and unload delays.
    pub fn with_delays(mut self, load_delay: Duration, unload_delay: Duration) -> Self {
        self.animations.load_delay = load_delay;
        self.animations.unload_delay = unload_delay;
        self
    }

    /// Set retry/timeout policy.
    pub fn with_error_handling(mut self, error_handling: ErrorHandlingOptions) -> Self {
        self.error_handling = error_handling;
        self
    }

    /// Set the snapshot compression level (0 stores the payload uncompressed).
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.performance.compression_level = level;
        self
    }

    /// Set the approximate memory ceiling in bytes.
    pub fn with_memory_limit(mut self, limit_bytes: u64) -> Self {
        self.performance.memory.limit_bytes = limit_bytes;
        self
    }

    /// Set the approximate memory ceiling in megabytes.
    pub fn with_memory_limit_mb(self, limit_mb: u64) -> Self {
        self.with_memory_limit(limit_mb * 1024 * 1024)
    }

    /// Check the configuration for values that would break the engine.
    pub fn validate(&self) -> Result<()> {
        if self.cache.max_size == 0 {
            return Err(Error::Config("cache.max_size must be at least 1".into()));
        }
        if self.cache.duration.is_zero() {
            return Err(Error::Config("cache.duration must be non-zero".into()));
        }
        if self.cache.cleanup_interval.is_zero() {
            return Err(Error::Config("cache.cleanup_interval must be non-zero".into()));
        }
        if self.performance.memory.cleanup_interval.is_zero() {
            return Err(Error::Config(
                "performance.memory.cleanup_interval must be non-zero".into(),
            ));
        }
        let persistence = &self.cache.persistence;
        if persistence.enabled {
            if persistence.storage_key.is_empty() {
                return Err(Error::Config("persistence storage key is empty".into()));
            }
            if persistence.save_interval.is_zero() {
                return Err(Error::Config("persistence.save_interval must be non-zero".into()));
            }
        }
        let threshold = self.observer.threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(Error::Config(format!(
                "observer.threshold must be in (0, 1], got {}",
                threshold
            )));
        }
        if self.observer.update_interval.is_zero() {
            return Err(Error::Config("observer.update_interval must be non-zero".into()));
        }
        if self
            .observer
            .breakpoints
            .windows(2)
            .any(|w| w[0].max_width >= w[1].max_width)
        {
            return Err(Error::Config(
                "observer breakpoints must be ordered by ascending max_width".into(),
            ));
        }
        if self.error_handling.timeout.is_zero() {
            return Err(Error::Config("error_handling.timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Content cache configuration.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Time-to-live of every entry.
    pub duration: Duration,

    /// Maximum number of entries.
    pub max_size: usize,

    /// Interval of the expiry/capacity/memory sweep.
    pub cleanup_interval: Duration,

    /// Snapshot persistence.
    pub persistence: PersistenceOptions,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(5 * 60),
            max_size: 5,
            cleanup_interval: Duration::from_secs(30),
            persistence: PersistenceOptions::default(),
        }
    }
}

/// Snapshot persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceOptions {
    /// Whether snapshots are loaded at startup and saved periodically.
    pub enabled: bool,

    /// Key under which the snapshot record is stored.
    pub storage_key: String,

    /// Interval between snapshot saves.
    pub save_interval: Duration,
}

impl Default for PersistenceOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            storage_key: "chunk_loader_cache".to_string(),
            save_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl PersistenceOptions {
    /// Persistence disabled.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Set the storage key.
    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    /// Set the save interval.
    pub fn with_save_interval(mut self, interval: Duration) -> Self {
        self.save_interval = interval;
        self
    }
}

/// Visibility sensor configuration.
#[derive(Debug, Clone)]
pub struct ObserverOptions {
    /// Visible-area proportion required to count as intersecting.
    pub threshold: f64,

    /// Margin table, ordered by ascending `max_width`; first match wins.
    pub breakpoints: Vec<MarginBreakpoint>,

    /// Margin used when no breakpoint matches.
    pub default_margin_px: u32,

    /// Debounce interval for viewport resizes.
    pub update_interval: Duration,
}

impl Default for ObserverOptions {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            breakpoints: MarginBreakpoint::default_table(),
            default_margin_px: 500,
            update_interval: Duration::from_secs(1),
        }
    }
}

impl ObserverOptions {
    /// Replace the breakpoint table.
    pub fn with_breakpoints(mut self, breakpoints: Vec<MarginBreakpoint>) -> Self {
        self.breakpoints = breakpoints;
        self
    }

    /// Set the intersection threshold.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the resize debounce interval.
    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }
}

/// Load/unload delays.
#[derive(Debug, Clone)]
pub struct AnimationOptions {
    /// Delay between entering the viewport and starting resolution.
    pub load_delay: Duration,

    /// Delay between leaving the viewport and clearing displayed content.
    pub unload_delay: Duration,
}

impl Default for AnimationOptions {
    fn default() -> Self {
        Self {
            load_delay: Duration::from_millis(100),
            unload_delay: Duration::from_millis(200),
        }
    }
}

/// Retry and timeout policy.
#[derive(Debug, Clone)]
pub struct ErrorHandlingOptions {
    /// Automatic retries before waiting for a manual retry.
    pub max_retries: u32,

    /// Delay before an automatic retry.
    pub retry_delay: Duration,

    /// Upper bound on a single load, measured from its start.
    pub timeout: Duration,
}

impl Default for ErrorHandlingOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Compression and memory options.
#[derive(Debug, Clone)]
pub struct PerformanceOptions {
    /// Snapshot compression level; 0 disables compression.
    pub compression_level: u32,

    /// Memory bound.
    pub memory: MemoryOptions,
}

impl Default for PerformanceOptions {
    fn default() -> Self {
        Self {
            compression_level: 6,
            memory: MemoryOptions::default(),
        }
    }
}

/// Approximate memory ceiling.
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    /// Limit on the estimated footprint, in bytes.
    pub limit_bytes: u64,

    /// Interval of the memory-only pressure pass.
    pub cleanup_interval: Duration,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            limit_bytes: 50 * 1024 * 1024,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = ChunkCullConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.max_size, 5);
        assert_eq!(config.cache.persistence.storage_key, "chunk_loader_cache");
        assert_eq!(config.error_handling.max_retries, 3);
        assert_eq!(config.performance.memory.limit_bytes, 50 * 1024 * 1024);
    }

    #[test]
    fn test_builder() {
        let config = ChunkCullConfig::new()
            .with_max_size(10)
            .with_cache_duration(Duration::from_secs(60))
            .with_delays(Duration::from_millis(5), Duration::from_millis(7))
            .with_memory_limit_mb(2)
            .with_persistence_enabled(false);

        assert_eq!(config.cache.max_size, 10);
        assert_eq!(config.cache.duration, Duration::from_secs(60));
        assert_eq!(config.animations.load_delay, Duration::from_millis(5));
        assert_eq!(config.animations.unload_delay, Duration::from_millis(7));
        assert_eq!(config.performance.memory.limit_bytes, 2 * 1024 * 1024);
        assert!(!config.cache.persistence.enabled);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(ChunkCullConfig::new().with_max_size(0).validate().is_err());

        let mut config = ChunkCullConfig::new();
        config.observer.threshold = 0.0;
        assert!(config.validate().is_err());

        let config = ChunkCullConfig::new()
            .with_persistence(PersistenceOptions::default().with_storage_key(""));
        assert!(config.validate().is_err());

        // Empty key is fine while persistence is off.
        let config = ChunkCullConfig::new()
            .with_persistence(PersistenceOptions::disabled().with_storage_key(""));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unordered_breakpoints() {
        let observer = ObserverOptions::default().with_breakpoints(vec![
            MarginBreakpoint::new(768, 300),
            MarginBreakpoint::new(480, 200),
        ]);
        let config = ChunkCullConfig::new().with_observer(observer);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
