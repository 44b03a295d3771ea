//! Content cache with TTL, LRU capacity bound and an approximate memory ceiling.
//!
//! [`ContentCache`] is the only owner of the shared key -> content map. Chunk
//! lifecycles and the persistence adapter reach it through `get`, `set`,
//! `clear`, `entries` and `hydrate`; nothing else mutates it.
//!
//! Every mutation computes the new [`CacheStatusSnapshot`] under the same
//! lock that applied it and hands it to the [`CacheEventBus`], so observers
//! never see a half-applied change.
//!
//! # Eviction
//!
//! A sweep runs in three phases, each reported as one coalesced notification:
//!
//! 1. drop entries with `now >= expiry`
//! 2. while over `max_size`, drop the least recently used entry
//! 3. while the estimated footprint is over the memory limit, drop entries
//!    in ascending `last_used` order
//!
//! ```rust
//! use chunkcull::cache::{CacheLimits, Content, ContentCache};
//! use chunkcull::clock::ManualClock;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let clock = Arc::new(ManualClock::new(0));
//! let cache = ContentCache::with_clock(CacheLimits::default(), clock.clone());
//!
//! cache.set("intro", Content::from("<p>hello</p>"));
//! assert!(cache.get("intro").is_some());
//!
//! clock.advance_ms(Duration::from_secs(301).as_millis() as u64);
//! assert!(cache.get("intro").is_none());
//! ```

mod content;
mod events;
mod memory;

pub use content::{CacheEntry, Content};
pub use events::{CacheEventBus, StatusListener, Subscription};
pub use memory::{estimate, FootprintEstimator};

use crate::clock::{Clock, RuntimeClock};
use crate::config::ChunkCullConfig;
use crate::error::ListenerError;
use crate::metrics::CacheMetrics;
use crate::types::{CacheStats, CacheStatusSnapshot, ChunkId, EvictionReason};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Bounds applied by the cache.
#[derive(Debug, Clone)]
pub struct CacheLimits {
    /// Time-to-live of every entry.
    pub duration: Duration,
    /// Maximum number of entries.
    pub max_size: usize,
    /// Ceiling on the estimated footprint, in bytes.
    pub memory_limit_bytes: u64,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self::from(&ChunkCullConfig::default())
    }
}

impl From<&ChunkCullConfig> for CacheLimits {
    fn from(config: &ChunkCullConfig) -> Self {
        Self {
            duration: config.cache.duration,
            max_size: config.cache.max_size,
            memory_limit_bytes: config.performance.memory.limit_bytes,
        }
    }
}

/// Entries removed by one sweep, per phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub capacity: usize,
    pub memory: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.expired + self.capacity + self.memory
    }
}

struct Slot {
    entry: CacheEntry,
    seq: u64,
}

/// Key -> entry map plus recency order.
#[derive(Default)]
struct Store {
    entries: HashMap<ChunkId, Slot>,
    // Recency sequence -> key; lowest sequence is least recently used.
    order: BTreeMap<u64, ChunkId>,
    next_seq: u64,
}

impl Store {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn bump(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn insert(&mut self, key: ChunkId, entry: CacheEntry) {
        let seq = self.bump();
        if let Some(old) = self.entries.insert(key.clone(), Slot { entry, seq }) {
            self.order.remove(&old.seq);
        }
        self.order.insert(seq, key);
    }

    /// Move `key` to the most recently used position.
    fn touch(&mut self, key: &str, now_ms: u64) -> Option<&CacheEntry> {
        let seq = self.next_seq;
        let slot = self.entries.get_mut(key)?;
        self.order.remove(&slot.seq);
        slot.seq = seq;
        slot.entry.last_used = now_ms;
        self.order.insert(seq, key.to_string());
        self.next_seq += 1;
        Some(&slot.entry)
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.seq);
        Some(slot.entry)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn least_recent(&self) -> Option<ChunkId> {
        self.order.values().next().cloned()
    }

    fn keys(&self) -> Vec<ChunkId> {
        self.order.values().cloned().collect()
    }

    fn footprint(&self) -> u64 {
        memory::estimate(
            self.order
                .values()
                .filter_map(|k| self.entries.get(k).map(|s| (k.as_str(), &s.entry.value))),
        )
    }

    fn remove_expired(&mut self, now_ms: u64) -> usize {
        let expired: Vec<ChunkId> = self
            .entries
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired(now_ms))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    fn enforce_capacity(&mut self, max_size: usize) -> usize {
        let mut removed = 0;
        while self.len() > max_size {
            let Some(key) = self.least_recent() else { break };
            self.remove(&key);
            removed += 1;
        }
        removed
    }

    fn enforce_memory(&mut self, limit_bytes: u64) -> usize {
        if self.footprint() <= limit_bytes {
            return 0;
        }

        let mut by_last_used: Vec<(u64, u64, ChunkId)> = self
            .entries
            .iter()
            .map(|(k, s)| (s.entry.last_used, s.seq, k.clone()))
            .collect();
        by_last_used.sort_unstable();

        let mut removed = 0;
        for (_, _, key) in by_last_used {
            if self.footprint() <= limit_bytes {
                break;
            }
            self.remove(&key);
            removed += 1;
        }
        removed
    }
}

/// The content cache. Construct once and share via `Arc`.
pub struct ContentCache {
    store: Mutex<Store>,
    limits: CacheLimits,
    clock: Arc<dyn Clock>,
    events: CacheEventBus,
    metrics: Arc<CacheMetrics>,
}

impl ContentCache {
    /// Create a cache driven by the tokio clock.
    pub fn new(limits: CacheLimits) -> Self {
        Self::with_clock(limits, Arc::new(RuntimeClock::new()))
    }

    /// Create a cache with an explicit clock.
    pub fn with_clock(limits: CacheLimits, clock: Arc<dyn Clock>) -> Self {
        let metrics = Arc::new(CacheMetrics::new());
        let initial = CacheStatusSnapshot {
            size: 0,
            max_size: limits.max_size,
            keys: Vec::new(),
        };
        Self {
            store: Mutex::new(Store::default()),
            events: CacheEventBus::new(initial, metrics.clone()),
            limits,
            clock,
            metrics,
        }
    }

    pub fn limits(&self) -> &CacheLimits {
        &self.limits
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub fn events(&self) -> &CacheEventBus {
        &self.events
    }

    /// Look up a live entry, marking it most recently used.
    ///
    /// Expired entries read as absent but stay in place until a sweep.
    pub fn get(&self, key: &str) -> Option<Content> {
        let started = Instant::now();
        let now = self.clock.now_ms();

        let value = {
            let mut store = self.store.lock();
            let live = store
                .entries
                .get(key)
                .is_some_and(|slot| !slot.entry.is_expired(now));
            if live {
                store.touch(key, now).map(|entry| entry.value.clone())
            } else {
                None
            }
        };

        self.metrics.record_lookup(value.is_some(), started.elapsed());
        value
    }

    /// Whether a live entry exists, without touching recency or metrics.
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        self.store
            .lock()
            .entries
            .get(key)
            .is_some_and(|slot| !slot.entry.is_expired(now))
    }

    /// Store `value` under `key` with a fresh expiry.
    ///
    /// Falsy values and values equal to the live one already stored are
    /// ignored, so repeated sets neither notify nor refresh `last_used`. An
    /// expired entry counts as absent and is replaced even if equal.
    pub fn set(&self, key: impl Into<ChunkId>, value: Content) {
        if value.is_falsy() {
            return;
        }
        let key = key.into();
        let now = self.clock.now_ms();

        let status = {
            let mut store = self.store.lock();
            if store
                .entries
                .get(&key)
                .is_some_and(|slot| !slot.entry.is_expired(now) && slot.entry.value == value)
            {
                return;
            }

            let report = self.sweep_locked(&mut store, now);
            let expiry = now + self.limits.duration.as_millis() as u64;
            store.insert(key.clone(), CacheEntry::new(value, expiry, now));
            // The new key is most recent, so this only ever drops older keys.
            let overflow = store.enforce_capacity(self.limits.max_size);
            self.metrics
                .record_evictions(EvictionReason::Capacity, overflow);

            if report.total() + overflow > 0 {
                debug!(
                    key = %key,
                    expired = report.expired,
                    capacity = report.capacity + overflow,
                    memory = report.memory,
                    "Evicted entries while inserting"
                );
            }
            self.status_locked(&store)
        };

        self.events.publish(status);
    }

    /// Remove every entry. Notifies only if the cache was non-empty.
    pub fn clear(&self) {
        let status = {
            let mut store = self.store.lock();
            if store.len() == 0 {
                return;
            }
            store.clear();
            self.status_locked(&store)
        };
        info!("Content cache cleared");
        self.events.publish(status);
    }

    /// Run the expiry, capacity and memory phases.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now_ms();
        let (report, status) = {
            let mut store = self.store.lock();
            let report = self.sweep_locked(&mut store, now);
            (report, self.status_locked(&store))
        };

        if report.total() > 0 {
            debug!(
                expired = report.expired,
                capacity = report.capacity,
                memory = report.memory,
                remaining = status.size,
                "Cache sweep evicted entries"
            );
            self.events.publish(status);
        }
        report
    }

    /// Run only the memory phase. Returns the number of entries dropped.
    pub fn enforce_memory_limit(&self) -> usize {
        let (removed, status) = {
            let mut store = self.store.lock();
            let removed = store.enforce_memory(self.limits.memory_limit_bytes);
            (removed, self.status_locked(&store))
        };
        if removed > 0 {
            self.metrics.record_evictions(EvictionReason::Memory, removed);
            debug!(removed, "Memory pressure pass evicted entries");
            self.events.publish(status);
        }
        removed
    }

    fn sweep_locked(&self, store: &mut Store, now: u64) -> SweepReport {
        let report = SweepReport {
            expired: store.remove_expired(now),
            capacity: store.enforce_capacity(self.limits.max_size),
            memory: store.enforce_memory(self.limits.memory_limit_bytes),
        };
        self.metrics
            .record_evictions(EvictionReason::Expired, report.expired);
        self.metrics
            .record_evictions(EvictionReason::Capacity, report.capacity);
        self.metrics
            .record_evictions(EvictionReason::Memory, report.memory);
        report
    }

    /// Replace the store with restored entries, in the given recency order.
    ///
    /// Entries keep their own expiry and `last_used`; nothing is filtered.
    pub fn hydrate(&self, entries: Vec<(ChunkId, CacheEntry)>) -> usize {
        let (count, status) = {
            let mut store = self.store.lock();
            store.clear();
            for (key, entry) in entries {
                store.insert(key, entry);
            }
            (store.len(), self.status_locked(&store))
        };
        self.events.publish(status);
        count
    }

    /// Copy of every entry, least recently used first.
    pub fn entries(&self) -> Vec<(ChunkId, CacheEntry)> {
        let store = self.store.lock();
        store
            .order
            .values()
            .filter_map(|k| store.entries.get(k).map(|s| (k.clone(), s.entry.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys, least recently used first.
    pub fn keys(&self) -> Vec<ChunkId> {
        self.store.lock().keys()
    }

    /// Estimated footprint in bytes.
    pub fn memory_usage(&self) -> u64 {
        self.store.lock().footprint()
    }

    /// Estimated footprint in megabytes.
    pub fn memory_usage_mb(&self) -> f64 {
        self.memory_usage() as f64 / (1024.0 * 1024.0)
    }

    /// Current status, as delivered to subscribers.
    pub fn status(&self) -> CacheStatusSnapshot {
        let store = self.store.lock();
        self.status_locked(&store)
    }

    fn status_locked(&self, store: &Store) -> CacheStatusSnapshot {
        CacheStatusSnapshot {
            size: store.len(),
            max_size: self.limits.max_size,
            keys: store.keys(),
        }
    }

    /// Subscribe to debounced status updates.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&CacheStatusSnapshot) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    pub fn stats(&self) -> CacheStats {
        let (entry_count, estimated_bytes) = {
            let store = self.store.lock();
            (store.len(), store.footprint())
        };
        let m = self.metrics.snapshot();
        CacheStats {
            entry_count,
            estimated_bytes,
            hits: m.hits,
            misses: m.misses,
            expired: m.expired,
            evicted_capacity: m.evicted_capacity,
            evicted_memory: m.evicted_memory,
            errors: m.errors,
        }
    }

    /// Spawn the periodic sweep and memory-pressure loops.
    ///
    /// Both stop when `shutdown` is cancelled.
    pub fn spawn_cleanup_loop(
        self: &Arc<Self>,
        cleanup_interval: Duration,
        memory_interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval_at(
                tokio::time::Instant::now() + cleanup_interval,
                cleanup_interval,
            );
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut memory = tokio::time::interval_at(
                tokio::time::Instant::now() + memory_interval,
                memory_interval,
            );
            memory.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sweep.tick() => {
                        cache.sweep();
                    }
                    _ = memory.tick() => {
                        cache.enforce_memory_limit();
                    }
                }
            }
            debug!("Cache cleanup loop stopped");
        })
    }
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCache")
            .field("entries", &self.len())
            .field("limits", &self.limits)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use parking_lot::Mutex as PlMutex;

    const MINUTE_MS: u64 = 60_000;

    fn limits(max_size: usize) -> CacheLimits {
        CacheLimits {
            duration: Duration::from_secs(5 * 60),
            max_size,
            memory_limit_bytes: 50 * 1024 * 1024,
        }
    }

    fn cache_with(limits: CacheLimits) -> (ContentCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (ContentCache::with_clock(limits, clock.clone()), clock)
    }

    fn record_statuses(cache: &ContentCache) -> Arc<PlMutex<Vec<CacheStatusSnapshot>>> {
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = cache.subscribe(move |s| {
            sink.lock().push(s.clone());
            Ok(())
        });
        seen
    }

    #[test]
    fn test_set_then_get_until_expiry() {
        let (cache, clock) = cache_with(limits(5));
        cache.set("a", "alpha".into());

        assert_eq!(cache.get("a"), Some(Content::from("alpha")));

        clock.advance_ms(5 * MINUTE_MS - 1);
        assert!(cache.get("a").is_some());

        clock.advance_ms(1);
        assert!(cache.get("a").is_none());
        // Expired entries are not deleted on read.
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.sweep().expired, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_get_records_hits_and_misses() {
        let (cache, _) = cache_with(limits(5));
        cache.set("a", "alpha".into());
        cache.get("a");
        cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
    }

    #[test]
    fn test_falsy_values_are_ignored() {
        let (cache, _) = cache_with(limits(5));
        let seen = record_statuses(&cache);

        cache.set("a", Content::Null);
        cache.set("b", "".into());
        cache.set("c", Content::Bool(false));

        assert!(cache.is_empty());
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_repeated_set_is_idempotent() {
        let (cache, clock) = cache_with(limits(5));
        let seen = record_statuses(&cache);

        cache.set("a", "alpha".into());
        let first = cache.entries()[0].1.clone();

        clock.advance_ms(10);
        cache.set("a", "alpha".into());
        let second = cache.entries()[0].1.clone();

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(first.last_used, second.last_used);
        assert_eq!(first.expiry, second.expiry);
    }

    #[test]
    fn test_set_overwrites_changed_value() {
        let (cache, clock) = cache_with(limits(5));
        cache.set("a", "v1".into());
        clock.advance_ms(MINUTE_MS);
        cache.set("a", "v2".into());

        assert_eq!(cache.get("a"), Some(Content::from("v2")));
        let (_, entry) = &cache.entries()[0];
        assert_eq!(entry.expiry, clock.now_ms() + 5 * MINUTE_MS);
    }

    #[test]
    fn test_same_value_refreshes_expired_entry() {
        let (cache, clock) = cache_with(limits(5));
        cache.set("a", "alpha".into());

        clock.advance_ms(5 * MINUTE_MS + 1);
        assert!(cache.get("a").is_none());

        cache.set("a", "alpha".into());
        assert_eq!(cache.get("a"), Some(Content::from("alpha")));
        let (_, entry) = &cache.entries()[0];
        assert_eq!(entry.expiry, clock.now_ms() + 5 * MINUTE_MS);
    }

    #[test]
    fn test_lru_evicts_least_recently_touched() {
        let (cache, clock) = cache_with(limits(5));
        for key in ["k1", "k2", "k3", "k4", "k5", "k6"] {
            clock.advance_ms(1);
            cache.set(key, Content::from(format!("value-{}", key)));
            clock.advance_ms(1);
            assert!(cache.get(key).is_some());
        }
        cache.sweep();

        assert_eq!(cache.len(), 5);
        assert!(!cache.contains("k1"));
        assert_eq!(cache.keys(), vec!["k2", "k3", "k4", "k5", "k6"]);
    }

    #[test]
    fn test_get_refreshes_recency() {
        let (cache, _) = cache_with(limits(3));
        cache.set("a", "1".into());
        cache.set("b", "2".into());
        cache.set("c", "3".into());

        cache.get("a");
        cache.set("d", "4".into());

        assert_eq!(cache.keys(), vec!["c", "a", "d"]);
    }

    #[test]
    fn test_memory_phase_evicts_oldest_last_used() {
        let mut l = limits(10);
        // Each entry is 1 byte of key + 100 bytes of value.
        l.memory_limit_bytes = 250;
        let (cache, clock) = cache_with(l);

        for key in ["a", "b", "c"] {
            clock.advance_ms(5);
            cache.set(key, Content::from("x".repeat(100)));
        }

        // Inserting "c" ran the pre-insert sweep with 202 bytes, so all three
        // are present until the next sweep.
        assert_eq!(cache.len(), 3);
        clock.advance_ms(5);
        cache.get("a");

        let report = cache.sweep();
        assert_eq!(report.memory, 1);
        assert_eq!(cache.keys(), vec!["c", "a"]);
        assert!(cache.memory_usage() <= 250);
    }

    #[test]
    fn test_memory_bound_holds_after_sweep() {
        let mut l = limits(50);
        l.memory_limit_bytes = 1_000;
        let (cache, clock) = cache_with(l);
        for i in 0..40 {
            clock.advance_ms(1);
            cache.set(format!("chunk-{}", i), Content::from("y".repeat(i * 7 + 1)));
        }
        cache.sweep();
        assert!(cache.is_empty() || cache.memory_usage() <= 1_000);
        assert!(cache.enforce_memory_limit() == 0);
    }

    #[test]
    fn test_single_oversized_entry_empties_cache() {
        let mut l = limits(5);
        l.memory_limit_bytes = 10;
        let (cache, _) = cache_with(l);
        cache.set("big", Content::from("z".repeat(64)));
        cache.sweep();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear_notifies_only_when_non_empty() {
        let (cache, _) = cache_with(limits(5));
        let seen = record_statuses(&cache);

        cache.clear();
        assert!(seen.lock().is_empty());

        cache.set("a", "alpha".into());
        cache.clear();
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].size, 0);
    }

    #[test]
    fn test_hydrate_bypasses_set_rules() {
        let (cache, clock) = cache_with(limits(5));
        let now = clock.now_ms();
        cache.hydrate(vec![
            ("old".into(), CacheEntry::new("expired".into(), now - 1, now - 10)),
            ("live".into(), CacheEntry::new("fresh".into(), now + MINUTE_MS, now - 5)),
        ]);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("old").is_none());
        assert_eq!(cache.get("live"), Some(Content::from("fresh")));
        assert_eq!(cache.keys(), vec!["old", "live"]);
    }

    #[test]
    fn test_status_reports_recency_order() {
        let (cache, _) = cache_with(limits(5));
        cache.set("a", "1".into());
        cache.set("b", "2".into());
        cache.get("a");

        let status = cache.status();
        assert_eq!(status.size, 2);
        assert_eq!(status.max_size, 5);
        assert_eq!(status.keys, vec!["b", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_burst_delivers_one_status() {
        let (cache, _) = cache_with(limits(5));
        let seen = record_statuses(&cache);

        cache.set("a", "1".into());
        cache.set("b", "2".into());
        cache.set("c", "3".into());
        tokio::time::sleep(Duration::from_millis(1)).await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].keys, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_loop_sweeps_expired_entries() {
        let cache = Arc::new(ContentCache::new(CacheLimits {
            duration: Duration::from_secs(10),
            ..limits(5)
        }));
        let shutdown = CancellationToken::new();
        let handle = cache.spawn_cleanup_loop(
            Duration::from_secs(30),
            Duration::from_secs(60),
            shutdown.clone(),
        );

        cache.set("a", "alpha".into());
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expired, 1);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
