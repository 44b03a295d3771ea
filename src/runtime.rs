//! Top-level wiring: one cache, its background loops, and mounted chunks.

use crate::cache::{CacheLimits, Content, ContentCache};
use crate::config::ChunkCullConfig;
use crate::error::Result;
use crate::lifecycle::{
    ChunkEventListener, ChunkLifecycle, ChunkState, ContentResolver, LifecycleOptions,
};
use crate::persistence::{PersistenceAdapter, SnapshotStore};
use crate::types::{CacheStats, ChunkId};
use crate::visibility::{ElementRef, IntersectionPrimitive, VisibilitySensor};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Viewport width assumed until the host reports one.
pub const DEFAULT_VIEWPORT_WIDTH: u32 = 1280;

/// A running chunk loader.
///
/// Owns the shared [`ContentCache`], restores it from the snapshot store at
/// startup, and runs the sweep, memory and save loops until
/// [`shutdown`](ChunkCull::shutdown).
pub struct ChunkCull {
    config: ChunkCullConfig,
    cache: Arc<ContentCache>,
    persistence: Option<Arc<PersistenceAdapter>>,
    primitive: Option<Arc<dyn IntersectionPrimitive>>,
    version: Mutex<Option<String>>,
    viewport_width: AtomicU32,
    sensors: Mutex<Vec<Weak<VisibilitySensor>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChunkCull {
    /// Validate `config`, restore the cache and start the background loops.
    pub async fn start(config: ChunkCullConfig, store: Arc<dyn SnapshotStore>) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(ContentCache::new(CacheLimits::from(&config)));
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let persistence = if config.cache.persistence.enabled {
            let adapter = Arc::new(PersistenceAdapter::from_config(
                cache.clone(),
                store,
                &config,
            ));
            adapter.load().await;
            tasks.push(adapter.spawn_save_loop(shutdown.child_token()));
            Some(adapter)
        } else {
            None
        };

        tasks.push(cache.spawn_cleanup_loop(
            config.cache.cleanup_interval,
            config.performance.memory.cleanup_interval,
            shutdown.child_token(),
        ));

        info!(
            max_size = config.cache.max_size,
            duration_ms = config.cache.duration.as_millis() as u64,
            persistence = persistence.is_some(),
            restored = cache.len(),
            "Chunk loader started"
        );

        Ok(Self {
            config,
            cache,
            persistence,
            primitive: None,
            version: Mutex::new(None),
            viewport_width: AtomicU32::new(DEFAULT_VIEWPORT_WIDTH),
            sensors: Mutex::new(Vec::new()),
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// Attach visibility sensors backed by `primitive` to chunks mounted
    /// from now on.
    pub fn with_intersection(mut self, primitive: Arc<dyn IntersectionPrimitive>) -> Self {
        self.primitive = Some(primitive);
        self
    }

    pub fn config(&self) -> &ChunkCullConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub fn persistence(&self) -> Option<&Arc<PersistenceAdapter>> {
        self.persistence.as_ref()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Mount a chunk. With an intersection primitive configured, a sensor
    /// observing `element` drives the lifecycle; otherwise the caller reports
    /// visibility through [`MountedChunk::visibility_changed`].
    pub fn mount_chunk(
        &self,
        chunk_id: impl Into<ChunkId>,
        element: Option<ElementRef>,
        resolver: Arc<dyn ContentResolver>,
        listener: Arc<dyn ChunkEventListener>,
    ) -> MountedChunk {
        let lifecycle = ChunkLifecycle::mount(
            chunk_id,
            self.cache.clone(),
            resolver,
            listener,
            LifecycleOptions::from(&self.config),
        );

        let sensor = self.primitive.as_ref().map(|primitive| {
            let sensor = Arc::new(VisibilitySensor::new(
                primitive.clone(),
                self.config.observer.clone(),
                self.viewport_width.load(Ordering::Relaxed),
            ));
            let handle = lifecycle.handle();
            sensor.attach(element, move |visible| handle.visibility_changed(visible));

            let mut sensors = self.sensors.lock();
            sensors.retain(|s| s.strong_count() > 0);
            sensors.push(Arc::downgrade(&sensor));
            sensor
        });

        MountedChunk { lifecycle, sensor }
    }

    /// Forward a viewport resize to every live sensor.
    pub fn viewport_resized(&self, width: u32) {
        self.viewport_width.store(width, Ordering::Relaxed);
        let sensors: Vec<Arc<VisibilitySensor>> =
            self.sensors.lock().iter().filter_map(Weak::upgrade).collect();
        for sensor in sensors {
            sensor.viewport_resized(width);
        }
    }

    /// Record the active content version. Switching from one version to
    /// another clears the cache. Returns whether it was cleared.
    pub fn set_version(&self, version: impl Into<String>) -> bool {
        let version = version.into();
        let mut current = self.version.lock();
        let cleared = match current.as_deref() {
            Some(previous) if previous != version => {
                self.cache.clear();
                info!(from = previous, to = %version, "Content version changed, cache cleared");
                true
            }
            _ => false,
        };
        *current = Some(version);
        cleared
    }

    pub fn version(&self) -> Option<String> {
        self.version.lock().clone()
    }

    /// Stop the background loops and write a final snapshot.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        if let Some(adapter) = &self.persistence {
            if let Err(e) = adapter.save().await {
                warn!(error = %e, "Final cache snapshot failed");
            }
        }
        info!(entries = self.cache.len(), "Chunk loader stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }
}

impl Drop for ChunkCull {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for ChunkCull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCull")
            .field("cache", &self.cache)
            .field("persistence", &self.persistence.is_some())
            .field("running", &self.is_running())
            .finish()
    }
}

/// A chunk mounted through [`ChunkCull::mount_chunk`]. Unmounts on drop.
pub struct MountedChunk {
    lifecycle: ChunkLifecycle,
    sensor: Option<Arc<VisibilitySensor>>,
}

impl MountedChunk {
    pub fn chunk_id(&self) -> &str {
        self.lifecycle.chunk_id()
    }

    pub fn lifecycle(&self) -> &ChunkLifecycle {
        &self.lifecycle
    }

    pub fn sensor(&self) -> Option<&Arc<VisibilitySensor>> {
        self.sensor.as_ref()
    }

    pub fn visibility_changed(&self, intersecting: bool) {
        self.lifecycle.visibility_changed(intersecting);
    }

    pub fn retry(&self) {
        self.lifecycle.retry();
    }

    pub fn state(&self) -> ChunkState {
        self.lifecycle.state()
    }

    pub fn content(&self) -> Option<Content> {
        self.lifecycle.content()
    }

    /// Detach the sensor and unmount the lifecycle.
    pub fn unmount(&self) {
        if let Some(sensor) = &self.sensor {
            sensor.detach();
        }
        self.lifecycle.unmount();
        debug!(chunk_id = %self.lifecycle.chunk_id(), "Mounted chunk released");
    }
}

impl Drop for MountedChunk {
    fn drop(&mut self) {
        if self.lifecycle.is_mounted() {
            self.unmount();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersistenceOptions;
    use crate::lifecycle::ChunkStatus;
    use crate::persistence::MemorySnapshotStore;
    use crate::testing::{ManualIntersection, RecordingListener, ScriptedResolver};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_sensor_drives_lifecycle() {
        let primitive = Arc::new(ManualIntersection::new());
        let cull = ChunkCull::start(ChunkCullConfig::default(), Arc::new(MemorySnapshotStore::new()))
            .await
            .unwrap()
            .with_intersection(primitive.clone());

        let listener = Arc::new(RecordingListener::new());
        let el = ElementRef::new("intro");
        let chunk = cull.mount_chunk(
            "intro",
            Some(el.clone()),
            Arc::new(ScriptedResolver::new()),
            listener.clone(),
        );

        primitive.enter(&el);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(chunk.state().status, ChunkStatus::Visible);
        assert_eq!(listener.loaded_count("intro"), 1);

        primitive.exit(&el);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(chunk.state().status, ChunkStatus::Idle);
        assert!(cull.cache().get("intro").is_some());

        drop(chunk);
        assert_eq!(primitive.active_observers(&el), 0);
        cull.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_reaches_mounted_sensors() {
        let primitive = Arc::new(ManualIntersection::new());
        let cull = ChunkCull::start(ChunkCullConfig::default(), Arc::new(MemorySnapshotStore::new()))
            .await
            .unwrap()
            .with_intersection(primitive.clone());
        let chunk = cull.mount_chunk(
            "a",
            Some(ElementRef::new("a")),
            Arc::new(ScriptedResolver::new()),
            Arc::new(RecordingListener::new()),
        );
        assert_eq!(chunk.sensor().map(|s| s.current_margin()), Some(500));

        cull.viewport_resized(375);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(chunk.sensor().map(|s| s.current_margin()), Some(200));
    }

    #[tokio::test]
    async fn test_set_version_clears_on_change() {
        let config = ChunkCullConfig::default().with_persistence(PersistenceOptions::disabled());
        let cull = ChunkCull::start(config, Arc::new(MemorySnapshotStore::new()))
            .await
            .unwrap();

        assert!(!cull.set_version("1.0.0"));
        cull.cache().set("a", "alpha".into());
        assert!(!cull.set_version("1.0.0"));
        assert_eq!(cull.cache().len(), 1);

        assert!(cull.set_version("1.0.1"));
        assert!(cull.cache().is_empty());
        assert_eq!(cull.version().as_deref(), Some("1.0.1"));
    }

    #[tokio::test]
    async fn test_shutdown_writes_final_snapshot() {
        let store = Arc::new(MemorySnapshotStore::new());
        let cull = ChunkCull::start(ChunkCullConfig::default(), store.clone())
            .await
            .unwrap();
        cull.cache().set("a", "alpha".into());

        cull.shutdown().await;
        assert!(!cull.is_running());
        assert!(store.get("chunk_loader_cache").is_some());

        let restored = ChunkCull::start(ChunkCullConfig::default(), store).await.unwrap();
        assert_eq!(restored.cache().get("a"), Some(Content::from("alpha")));
        restored.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let config = ChunkCullConfig::default().with_max_size(0);
        let result = ChunkCull::start(config, Arc::new(MemorySnapshotStore::new())).await;
        assert!(result.is_err());
    }
}
