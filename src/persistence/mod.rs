//! Snapshot persistence for the content cache.
//!
//! At startup [`PersistenceAdapter::load`] reads the record stored under the
//! configured key and, if it is younger than the cache duration, hydrates
//! the cache with its entries. Any failure along the way (missing, stale,
//! corrupt, checksum mismatch, unreadable storage) is logged and treated as
//! a cold start.
//!
//! In steady state the save loop encodes the current entries on a fixed
//! interval. A failed write is logged and leaves the cache untouched.

mod format;
mod store;

pub use format::{PersistedEntry, SnapshotRecord, MAX_PAYLOAD_SIZE};
pub use store::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};

use crate::cache::{CacheEntry, ContentCache};
use crate::config::{ChunkCullConfig, PersistenceOptions};
use crate::error::PersistenceError;
use crate::metrics::{ERROR_PERSISTENCE_READ, ERROR_PERSISTENCE_WRITE};
use crate::types::ChunkId;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Loads and saves cache snapshots through a [`SnapshotStore`].
pub struct PersistenceAdapter {
    cache: Arc<ContentCache>,
    store: Arc<dyn SnapshotStore>,
    options: PersistenceOptions,
    compression_level: u32,
}

impl PersistenceAdapter {
    pub fn new(
        cache: Arc<ContentCache>,
        store: Arc<dyn SnapshotStore>,
        options: PersistenceOptions,
        compression_level: u32,
    ) -> Self {
        Self {
            cache,
            store,
            options,
            compression_level,
        }
    }

    pub fn from_config(
        cache: Arc<ContentCache>,
        store: Arc<dyn SnapshotStore>,
        config: &ChunkCullConfig,
    ) -> Self {
        Self::new(
            cache,
            store,
            config.cache.persistence.clone(),
            config.performance.compression_level,
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.options.enabled
    }

    pub fn storage_key(&self) -> &str {
        &self.options.storage_key
    }

    /// Hydrate the cache from the stored snapshot.
    ///
    /// Returns the number of entries restored; 0 on a cold start.
    pub async fn load(&self) -> usize {
        if !self.options.enabled {
            return 0;
        }
        let key = self.options.storage_key.as_str();

        match self.read_entries().await {
            Ok(Some(entries)) => {
                let count = self.cache.hydrate(entries);
                self.cache.metrics().snapshots_loaded.inc();
                info!(storage_key = key, entries = count, "Restored cache snapshot");
                count
            }
            Ok(None) => {
                debug!(storage_key = key, "No cache snapshot found");
                0
            }
            Err(PersistenceError::Stale { age_ms, max_age_ms }) => {
                info!(
                    storage_key = key,
                    age_ms, max_age_ms, "Ignoring stale cache snapshot"
                );
                0
            }
            Err(e) => {
                warn!(storage_key = key, error = %e, "Failed to restore cache snapshot, starting cold");
                self.cache.metrics().record_error(ERROR_PERSISTENCE_READ);
                0
            }
        }
    }

    async fn read_entries(&self) -> Result<Option<Vec<(ChunkId, CacheEntry)>>, PersistenceError> {
        let Some(raw) = self.store.read(&self.options.storage_key).await? else {
            return Ok(None);
        };
        let record = SnapshotRecord::from_json(&raw)?;
        let now = self.cache.clock().now_ms();
        record.decode(now, self.cache.limits().duration).map(Some)
    }

    /// Encode the current entries and write them to the store.
    pub async fn save(&self) -> Result<(), PersistenceError> {
        if !self.options.enabled {
            return Ok(());
        }
        let started = Instant::now();

        let result = self.write_snapshot().await;
        match &result {
            Ok((entries, bytes)) => {
                self.cache
                    .metrics()
                    .record_snapshot_saved(started.elapsed(), *bytes);
                info!(
                    storage_key = %self.options.storage_key,
                    entries,
                    bytes,
                    "Saved cache snapshot"
                );
            }
            Err(_) => self.cache.metrics().record_error(ERROR_PERSISTENCE_WRITE),
        }
        result.map(|_| ())
    }

    async fn write_snapshot(&self) -> Result<(usize, usize), PersistenceError> {
        let entries = self.cache.entries();
        let now = self.cache.clock().now_ms();
        let record = SnapshotRecord::encode(&entries, now, self.compression_level)?;
        let json = record.to_json()?;
        let bytes = json.len();
        self.store.write(&self.options.storage_key, json).await?;
        Ok((entries.len(), bytes))
    }

    /// Spawn the periodic save loop. Stops when `shutdown` is cancelled.
    pub fn spawn_save_loop(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let adapter = self.clone();
        let period = self.options.save_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = adapter.save().await {
                            warn!(error = %e, "Periodic cache snapshot failed");
                        }
                    }
                }
            }
            debug!("Snapshot save loop stopped");
        })
    }

    pub fn save_interval(&self) -> Duration {
        self.options.save_interval
    }
}

impl std::fmt::Debug for PersistenceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceAdapter")
            .field("options", &self.options)
            .field("compression_level", &self.compression_level)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheLimits, Content};
    use crate::clock::ManualClock;

    const START: u64 = 1_700_000_000_000;
    const KEY: &str = "chunk_loader_cache";

    fn setup() -> (Arc<ContentCache>, Arc<ManualClock>, Arc<MemorySnapshotStore>, PersistenceAdapter) {
        let clock = Arc::new(ManualClock::new(START));
        let cache = Arc::new(ContentCache::with_clock(CacheLimits::default(), clock.clone()));
        let store = Arc::new(MemorySnapshotStore::new());
        let adapter = PersistenceAdapter::new(
            cache.clone(),
            store.clone(),
            PersistenceOptions::default(),
            6,
        );
        (cache, clock, store, adapter)
    }

    #[tokio::test]
    async fn test_save_then_load_restores_entries() {
        let (cache, clock, store, adapter) = setup();
        cache.set("a", "alpha".into());
        clock.advance_ms(5);
        cache.set("b", Content::from(vec!["x".into(), "y".into()]));
        adapter.save().await.unwrap();
        assert!(store.get(KEY).is_some());

        let fresh = Arc::new(ContentCache::with_clock(CacheLimits::default(), clock.clone()));
        let restored = PersistenceAdapter::new(fresh.clone(), store, PersistenceOptions::default(), 6);
        clock.advance_ms(60_000);
        assert_eq!(restored.load().await, 2);

        assert_eq!(fresh.entries(), cache.entries());
        assert_eq!(fresh.get("a"), Some(Content::from("alpha")));
        assert_eq!(fresh.metrics().snapshots_loaded.get(), 1);
    }

    #[tokio::test]
    async fn test_non_finite_number_does_not_poison_snapshot() {
        let (cache, clock, store, adapter) = setup();
        cache.set("good", "alpha".into());
        cache.set(
            "chart",
            Content::from(vec![Content::Number(f64::INFINITY), 3i64.into()]),
        );
        adapter.save().await.unwrap();

        let fresh = Arc::new(ContentCache::with_clock(CacheLimits::default(), clock.clone()));
        let restored = PersistenceAdapter::new(fresh.clone(), store, PersistenceOptions::default(), 6);
        assert_eq!(restored.load().await, 2);
        assert_eq!(fresh.get("good"), Some(Content::from("alpha")));
        assert_eq!(
            fresh.get("chart"),
            Some(Content::from(vec![Content::Null, 3i64.into()]))
        );
        assert_eq!(fresh.stats().errors, 0);
    }

    #[tokio::test]
    async fn test_stale_snapshot_ignored() {
        let (cache, clock, store, adapter) = setup();
        cache.set("a", "alpha".into());
        adapter.save().await.unwrap();

        let fresh = Arc::new(ContentCache::with_clock(CacheLimits::default(), clock.clone()));
        let restored = PersistenceAdapter::new(fresh.clone(), store, PersistenceOptions::default(), 6);
        clock.advance_ms(5 * 60_000 + 1);

        assert_eq!(restored.load().await, 0);
        assert!(fresh.is_empty());
        // Stale is an expected outcome, not an error.
        assert_eq!(fresh.stats().errors, 0);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_cold_start() {
        let (cache, _, store, adapter) = setup();
        store.insert(KEY, "{ this is not json");
        assert_eq!(adapter.load().await, 0);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_unreadable_store_is_cold_start() {
        let (cache, _, store, adapter) = setup();
        store.set_fail_reads(true);
        assert_eq!(adapter.load().await, 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_hydrated_entries_keep_their_expiry() {
        let (_, clock, store, _) = setup();
        let record = SnapshotRecord::encode(
            &[
                ("gone".to_string(), CacheEntry::new("old".into(), START - 1, START - 100)),
                ("kept".to_string(), CacheEntry::new("new".into(), START + 1_000, START - 50)),
            ],
            START - 10,
            6,
        )
        .unwrap();
        store.insert(KEY, record.to_json().unwrap());

        let cache = Arc::new(ContentCache::with_clock(CacheLimits::default(), clock.clone()));
        let adapter = PersistenceAdapter::new(cache.clone(), store, PersistenceOptions::default(), 6);
        assert_eq!(adapter.load().await, 2);
        assert!(cache.get("gone").is_none());
        assert!(cache.get("kept").is_some());
    }

    #[tokio::test]
    async fn test_write_failure_leaves_cache_untouched() {
        let (cache, _, store, adapter) = setup();
        cache.set("a", "alpha".into());
        store.set_fail_writes(true);

        assert!(matches!(adapter.save().await, Err(PersistenceError::Write(_))));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().errors, 1);
        assert!(store.get(KEY).is_none());
    }

    #[tokio::test]
    async fn test_disabled_persistence_is_inert() {
        let (cache, _, store, _) = setup();
        let adapter = PersistenceAdapter::new(cache.clone(), store.clone(), PersistenceOptions::disabled(), 6);
        cache.set("a", "alpha".into());
        adapter.save().await.unwrap();
        assert!(store.get(KEY).is_none());
        assert_eq!(adapter.load().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_loop_writes_on_interval() {
        let (cache, _, store, _) = setup();
        let adapter = Arc::new(PersistenceAdapter::new(
            cache.clone(),
            store.clone(),
            PersistenceOptions::default().with_save_interval(Duration::from_secs(10)),
            6,
        ));
        cache.set("a", "alpha".into());

        let shutdown = CancellationToken::new();
        let handle = adapter.spawn_save_loop(shutdown.clone());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(store.get(KEY).is_none());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(store.get(KEY).is_some());
        assert_eq!(cache.metrics().snapshots_saved.get(), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_round_trip_through_adapter() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, clock, _, _) = setup();
        let store = Arc::new(FileSnapshotStore::open(dir.path()).unwrap());
        let adapter = PersistenceAdapter::new(cache.clone(), store.clone(), PersistenceOptions::default(), 6);
        cache.set("a", "alpha".into());
        adapter.save().await.unwrap();

        let fresh = Arc::new(ContentCache::with_clock(CacheLimits::default(), clock));
        let restored = PersistenceAdapter::new(fresh.clone(), store, PersistenceOptions::default(), 6);
        assert_eq!(restored.load().await, 1);
        assert_eq!(fresh.get("a"), Some(Content::from("alpha")));
    }
}
