//! Visibility-driven chunk loading with a bounded content cache.
//!
//! Page content is split into chunks. Each chunk is materialized only while
//! it is near the viewport and released shortly after it scrolls away. Loaded
//! content lands in a shared cache so coming back is instant:
//!
//! - **Visibility**: an intersection primitive with a viewport-dependent
//!   margin reports enter/exit transitions
//! - **Lifecycle**: a per-chunk state machine with load/unload delays,
//!   timeouts and bounded retries
//! - **Cache**: TTL + LRU capacity + memory-footprint eviction, with
//!   coalesced status notifications
//! - **Persistence**: periodic compressed snapshots restored at startup
//!
//! # Example
//!
//! ```rust,no_run
//! use chunkcull::persistence::FileSnapshotStore;
//! use chunkcull::testing::{ManualIntersection, RecordingListener, ScriptedResolver};
//! use chunkcull::visibility::ElementRef;
//! use chunkcull::{ChunkCull, ChunkCullConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     chunkcull::logging::init();
//!
//!     let config = ChunkCullConfig::new()
//!         .with_max_size(10)
//!         .with_cache_duration(Duration::from_secs(600));
//!     let store = Arc::new(FileSnapshotStore::open("./snapshots")?);
//!     let primitive = Arc::new(ManualIntersection::new());
//!
//!     let cull = ChunkCull::start(config, store)
//!         .await?
//!         .with_intersection(primitive.clone());
//!
//!     let el = ElementRef::new("pricing");
//!     let chunk = cull.mount_chunk(
//!         "pricing",
//!         Some(el.clone()),
//!         Arc::new(ScriptedResolver::new()),
//!         Arc::new(RecordingListener::new()),
//!     );
//!
//!     primitive.enter(&el);
//!     tokio::time::sleep(Duration::from_millis(200)).await;
//!     println!("{:?}", chunk.content());
//!
//!     cull.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  enter/exit   ┌────────────────┐  resolve   ┌──────────┐
//! │ Visibility   │──────────────▶│ ChunkLifecycle │───────────▶│ Resolver │
//! │ Sensor       │               └────────────────┘            └──────────┘
//! └──────────────┘                  │ get / set
//!                                   ▼
//!                          ┌────────────────┐  snapshot  ┌───────────────┐
//!                          │ ContentCache   │───────────▶│ SnapshotStore │
//!                          │ TTL/LRU/memory │◀───────────│ (file/memory) │
//!                          └────────────────┘  restore   └───────────────┘
//!                                   │ status
//!                                   ▼
//!                            status listeners
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod persistence;
pub mod runtime;
pub mod testing;
pub mod types;
pub mod visibility;

// Re-export main types for convenience
pub use cache::{CacheEntry, CacheLimits, Content, ContentCache, Subscription};
pub use config::{
    AnimationOptions, CacheOptions, ChunkCullConfig, ErrorHandlingOptions, MemoryOptions,
    ObserverOptions, PerformanceOptions, PersistenceOptions,
};
pub use error::{Error, LoadError, PersistenceError, Result};
pub use runtime::{ChunkCull, MountedChunk};
pub use types::{CacheStats, CacheStatusSnapshot, ChunkId, EvictionReason};

pub use lifecycle::{
    ChunkEvent, ChunkEventListener, ChunkLifecycle, ChunkState, ChunkStatus, ContentResolver,
    Resolution,
};
pub use persistence::{FileSnapshotStore, MemorySnapshotStore, PersistenceAdapter, SnapshotStore};
pub use visibility::{ElementRef, IntersectionPrimitive, MarginBreakpoint, VisibilitySensor};

pub use metrics::{CacheMetrics, MetricsSnapshot};
