//! Per-chunk lifecycle: when to load, show, hide and retry.
//!
//! A [`ChunkLifecycle`] is mounted for one chunk id. It feeds visibility
//! changes, load outcomes and timer expiries through the pure
//! [`transition`] function and carries out the resulting [`Effect`]s.
//!
//! Events for one chunk are processed strictly one at a time. The load,
//! retry and unload timers are owned by the lifecycle and all of them are
//! cancelled together by [`ChunkLifecycle::unmount`]; once that returns no
//! transition runs and no listener is called, including for a resolution
//! that was already in flight.
//!
//! # Example
//!
//! ```rust,no_run
//! use chunkcull::cache::{CacheLimits, ContentCache};
//! use chunkcull::lifecycle::{ChunkLifecycle, LifecycleOptions, LoggingChunkListener};
//! use chunkcull::testing::ScriptedResolver;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let cache = Arc::new(ContentCache::new(CacheLimits::default()));
//! let lifecycle = ChunkLifecycle::mount(
//!     "gallery",
//!     cache,
//!     Arc::new(ScriptedResolver::new()),
//!     Arc::new(LoggingChunkListener),
//!     LifecycleOptions::default(),
//! );
//!
//! lifecycle.visibility_changed(true);
//! let mut view = lifecycle.watch();
//! view.changed().await.ok();
//! # }
//! ```

mod events;
mod state;
mod timers;

pub use events::{ChunkEvent, ChunkEventListener, LoggingChunkListener, NoopChunkListener};
pub use state::{
    transition, ChunkState, ChunkStatus, Effect, LifecycleEvent, Limits, Transition,
};
pub use timers::{TimerKind, TimerSet};

use crate::cache::{Content, ContentCache};
use crate::config::ChunkCullConfig;
use crate::error::LoadError;
use crate::types::ChunkId;
use async_trait::async_trait;
use parking_lot::{Mutex, ReentrantMutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Error type resolvers may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What a successful resolution produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Content(Content),
    /// Stand-in content produced without the real source (a fallback or a
    /// simulated load). Treated as a success.
    Synthetic { content: Content, message: String },
}

impl Resolution {
    pub fn content(&self) -> &Content {
        match self {
            Resolution::Content(c) | Resolution::Synthetic { content: c, .. } => c,
        }
    }
}

impl From<Content> for Resolution {
    fn from(content: Content) -> Self {
        Resolution::Content(content)
    }
}

/// Produces the content of a chunk.
#[async_trait]
pub trait ContentResolver: Send + Sync + 'static {
    async fn resolve(&self, chunk_id: &str) -> Result<Resolution, BoxError>;
}

/// Timing and retry settings for a lifecycle.
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    pub load_delay: Duration,
    pub unload_delay: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Measured from the start of a load attempt, load delay included.
    pub timeout: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self::from(&ChunkCullConfig::default())
    }
}

impl From<&ChunkCullConfig> for LifecycleOptions {
    fn from(config: &ChunkCullConfig) -> Self {
        Self {
            load_delay: config.animations.load_delay,
            unload_delay: config.animations.unload_delay,
            max_retries: config.error_handling.max_retries,
            retry_delay: config.error_handling.retry_delay,
            timeout: config.error_handling.timeout,
        }
    }
}

impl LifecycleOptions {
    pub fn limits(&self) -> Limits {
        Limits {
            max_retries: self.max_retries,
        }
    }
}

/// What an observer of a chunk sees.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChunkView {
    pub state: ChunkState,
    /// Content currently on screen.
    pub content: Option<Content>,
}

enum Input {
    Visibility(bool),
    LoadSettled {
        generation: u64,
        outcome: Result<Resolution, LoadError>,
    },
    RetryElapsed(u64),
    UnloadElapsed(u64),
    ManualRetry,
}

struct Core {
    state: ChunkState,
    content: Option<Content>,
    timers: TimerSet,
    // Inputs staged for the effects of the transition in progress.
    prefetched: Option<Content>,
    settled: Option<Content>,
}

struct Shared {
    chunk_id: ChunkId,
    cache: Arc<ContentCache>,
    resolver: Arc<dyn ContentResolver>,
    listener: Arc<dyn ChunkEventListener>,
    options: LifecycleOptions,
    // Serializes transitions; reentrant so listeners may call back in.
    gate: ReentrantMutex<()>,
    core: Mutex<Core>,
    unmounted: AtomicBool,
    view: watch::Sender<ChunkView>,
    shutdown: CancellationToken,
}

/// The lifecycle of one mounted chunk. Unmounts on drop.
pub struct ChunkLifecycle {
    shared: Arc<Shared>,
}

/// Weak handle for feeding events from callbacks (e.g. a visibility sensor).
#[derive(Clone)]
pub struct LifecycleHandle {
    shared: Weak<Shared>,
}

impl LifecycleHandle {
    pub fn visibility_changed(&self, intersecting: bool) {
        if let Some(shared) = self.shared.upgrade() {
            shared.dispatch(Input::Visibility(intersecting));
        }
    }

    pub fn retry(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.dispatch(Input::ManualRetry);
        }
    }
}

impl ChunkLifecycle {
    /// Mount a lifecycle for `chunk_id`. Must be called inside a tokio runtime.
    pub fn mount(
        chunk_id: impl Into<ChunkId>,
        cache: Arc<ContentCache>,
        resolver: Arc<dyn ContentResolver>,
        listener: Arc<dyn ChunkEventListener>,
        options: LifecycleOptions,
    ) -> Self {
        let chunk_id = chunk_id.into();
        let shutdown = CancellationToken::new();
        let (view, _) = watch::channel(ChunkView::default());
        debug!(chunk_id = %chunk_id, "Chunk mounted");

        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(Core {
                    state: ChunkState::default(),
                    content: None,
                    timers: TimerSet::new(&shutdown),
                    prefetched: None,
                    settled: None,
                }),
                chunk_id,
                cache,
                resolver,
                listener,
                options,
                gate: ReentrantMutex::new(()),
                unmounted: AtomicBool::new(false),
                view,
                shutdown,
            }),
        }
    }

    pub fn chunk_id(&self) -> &str {
        &self.shared.chunk_id
    }

    pub fn handle(&self) -> LifecycleHandle {
        LifecycleHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Report an enter (`true`) or exit (`false`) transition.
    pub fn visibility_changed(&self, intersecting: bool) {
        self.shared.dispatch(Input::Visibility(intersecting));
    }

    /// Retry a failed chunk, resetting its retry count.
    pub fn retry(&self) {
        self.shared.dispatch(Input::ManualRetry);
    }

    pub fn state(&self) -> ChunkState {
        self.shared.core.lock().state.clone()
    }

    pub fn status(&self) -> ChunkStatus {
        self.shared.core.lock().state.status
    }

    /// Content currently on screen.
    pub fn content(&self) -> Option<Content> {
        self.shared.core.lock().content.clone()
    }

    /// Whether a retry affordance should be shown.
    pub fn can_retry(&self) -> bool {
        self.state().can_retry(self.shared.options.max_retries)
    }

    /// Subscribe to state and content changes.
    pub fn watch(&self) -> watch::Receiver<ChunkView> {
        self.shared.view.subscribe()
    }

    pub fn pending_timers(&self) -> Vec<TimerKind> {
        self.shared.core.lock().timers.pending()
    }

    pub fn is_mounted(&self) -> bool {
        !self.shared.unmounted.load(Ordering::SeqCst)
    }

    /// Cancel every timer and stop all further transitions and callbacks.
    pub fn unmount(&self) {
        let _gate = self.shared.gate.lock();
        if self.shared.unmounted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.core.lock().timers.cancel_all();
        self.shared.shutdown.cancel();
        debug!(chunk_id = %self.shared.chunk_id, "Chunk unmounted");
    }
}

impl Drop for ChunkLifecycle {
    fn drop(&mut self) {
        self.unmount();
    }
}

impl std::fmt::Debug for ChunkLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkLifecycle")
            .field("chunk_id", &self.shared.chunk_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Shared {
    fn dispatch(self: &Arc<Self>, input: Input) {
        let _gate = self.gate.lock();
        if self.unmounted.load(Ordering::SeqCst) {
            return;
        }

        let notifications = {
            let mut core = self.core.lock();
            let Some(event) = self.accept(&mut core, input) else {
                return;
            };

            let t = transition(&core.state, event, &self.options.limits());
            if t.moved(&core.state) {
                debug!(
                    chunk_id = %self.chunk_id,
                    from = core.state.status.as_str(),
                    to = t.state.status.as_str(),
                    retry_count = t.state.retry_count,
                    "Chunk transition"
                );
            }
            core.state = t.state;

            let mut out = Vec::new();
            for effect in t.effects {
                self.apply(&mut core, effect, &mut out);
            }
            core.prefetched = None;
            core.settled = None;

            self.view.send_replace(ChunkView {
                state: core.state.clone(),
                content: core.content.clone(),
            });
            out
        };

        for event in notifications {
            self.listener.on_event(event);
        }
    }

    /// Turn an input into a state machine event, dropping superseded ones.
    fn accept(&self, core: &mut Core, input: Input) -> Option<LifecycleEvent> {
        match input {
            Input::Visibility(intersecting) => {
                let cached = if intersecting && core.state.status == ChunkStatus::Idle {
                    core.prefetched = self.cache.get(&self.chunk_id);
                    core.prefetched.is_some()
                } else {
                    false
                };
                Some(LifecycleEvent::VisibilityChanged {
                    intersecting,
                    cached,
                })
            }
            Input::LoadSettled {
                generation,
                outcome,
            } => {
                if !core.timers.complete(TimerKind::Load, generation) {
                    debug!(chunk_id = %self.chunk_id, "Dropping superseded load result");
                    return None;
                }
                Some(match outcome {
                    Ok(Resolution::Content(content)) => {
                        core.settled = Some(content);
                        LifecycleEvent::LoadSucceeded { synthetic: None }
                    }
                    Ok(Resolution::Synthetic { content, message }) => {
                        core.settled = Some(content);
                        LifecycleEvent::LoadSucceeded {
                            synthetic: Some(message),
                        }
                    }
                    Err(error) => LifecycleEvent::LoadFailed(error),
                })
            }
            Input::RetryElapsed(generation) => core
                .timers
                .complete(TimerKind::Retry, generation)
                .then_some(LifecycleEvent::RetryElapsed),
            Input::UnloadElapsed(generation) => core
                .timers
                .complete(TimerKind::Unload, generation)
                .then_some(LifecycleEvent::UnloadElapsed),
            Input::ManualRetry => Some(LifecycleEvent::ManualRetry),
        }
    }

    fn apply(self: &Arc<Self>, core: &mut Core, effect: Effect, out: &mut Vec<ChunkEvent>) {
        let chunk_id = || self.chunk_id.clone();
        match effect {
            Effect::AdoptCached => core.content = core.prefetched.take(),
            Effect::StartLoad => self.start_load(core),
            Effect::CancelLoad => core.timers.cancel(TimerKind::Load),
            Effect::StoreAndShow => {
                if let Some(content) = core.settled.take() {
                    self.cache.set(self.chunk_id.clone(), content.clone());
                    core.content = Some(content);
                }
            }
            Effect::NotifyLoaded { from_cache } => out.push(ChunkEvent::Loaded {
                chunk_id: chunk_id(),
                from_cache,
            }),
            Effect::NotifyUnloaded => out.push(ChunkEvent::Unloaded {
                chunk_id: chunk_id(),
            }),
            Effect::NotifyError {
                error,
                retry_scheduled,
            } => {
                debug!(chunk_id = %self.chunk_id, error = %error, retry_scheduled, "Chunk load failed");
                out.push(ChunkEvent::Error {
                    chunk_id: chunk_id(),
                    error,
                    retry_scheduled,
                });
            }
            Effect::NotifySynthetic { message } => out.push(ChunkEvent::SyntheticLoadCompleted {
                chunk_id: chunk_id(),
                message,
            }),
            Effect::ScheduleRetry => {
                let delay = self.options.retry_delay;
                let weak = Arc::downgrade(self);
                core.timers.start(TimerKind::Retry, move |generation| async move {
                    tokio::time::sleep(delay).await;
                    if let Some(shared) = weak.upgrade() {
                        shared.dispatch(Input::RetryElapsed(generation));
                    }
                });
            }
            Effect::CancelRetry => core.timers.cancel(TimerKind::Retry),
            Effect::ScheduleUnload => {
                let delay = self.options.unload_delay;
                let weak = Arc::downgrade(self);
                core.timers.start(TimerKind::Unload, move |generation| async move {
                    tokio::time::sleep(delay).await;
                    if let Some(shared) = weak.upgrade() {
                        shared.dispatch(Input::UnloadElapsed(generation));
                    }
                });
            }
            Effect::CancelUnload => core.timers.cancel(TimerKind::Unload),
            Effect::ClearContent => core.content = None,
        }
    }

    fn start_load(self: &Arc<Self>, core: &mut Core) {
        let weak = Arc::downgrade(self);
        let resolver = self.resolver.clone();
        let chunk_id = self.chunk_id.clone();
        let delay = self.options.load_delay;
        let timeout = self.options.timeout;

        core.timers.start(TimerKind::Load, move |generation| async move {
            let attempt = async {
                tokio::time::sleep(delay).await;
                resolver.resolve(&chunk_id).await
            };
            let outcome = match tokio::time::timeout(timeout, attempt).await {
                Ok(Ok(resolution)) => Ok(resolution),
                Ok(Err(e)) => Err(LoadError::Failure {
                    chunk_id: chunk_id.clone(),
                    reason: e.to_string(),
                }),
                Err(_) => Err(LoadError::Timeout {
                    chunk_id: chunk_id.clone(),
                    timeout,
                }),
            };
            if let Some(shared) = weak.upgrade() {
                shared.dispatch(Input::LoadSettled {
                    generation,
                    outcome,
                });
            }
        });
    }
}
