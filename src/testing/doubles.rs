//! Scripted collaborators for driving chunk lifecycles in tests.

use crate::cache::Content;
use crate::lifecycle::{BoxError, ChunkEvent, ChunkEventListener, ContentResolver, Resolution};
use crate::types::ChunkId;
use crate::visibility::{
    ElementRef, IntersectionEntry, IntersectionOptions, IntersectionPrimitive, IntersectionSink,
    Observation,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One scripted resolver outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Script {
    Content(Content),
    Synthetic { content: Content, message: String },
    Fail(String),
    /// Never settles.
    Hang,
}

#[derive(Debug, Clone)]
struct Step {
    latency: Duration,
    script: Script,
}

/// Resolver that replays queued outcomes per chunk.
///
/// Once a chunk's queue is empty it resolves to `"content for <id>"` after
/// the default latency.
#[derive(Debug, Default)]
pub struct ScriptedResolver {
    scripts: Mutex<HashMap<ChunkId, VecDeque<Step>>>,
    calls: Mutex<HashMap<ChunkId, usize>>,
    latency: Duration,
}

impl ScriptedResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latency applied to unscripted resolutions.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn push(&self, chunk_id: &str, script: Script) {
        self.push_after(chunk_id, Duration::ZERO, script);
    }

    pub fn push_after(&self, chunk_id: &str, latency: Duration, script: Script) {
        self.scripts
            .lock()
            .entry(chunk_id.to_string())
            .or_default()
            .push_back(Step { latency, script });
    }

    /// Queue `times` consecutive failures.
    pub fn fail_times(&self, chunk_id: &str, times: usize, reason: &str) {
        for _ in 0..times {
            self.push(chunk_id, Script::Fail(reason.to_string()));
        }
    }

    /// Number of resolutions started for `chunk_id`.
    pub fn calls(&self, chunk_id: &str) -> usize {
        self.calls.lock().get(chunk_id).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    pub fn default_content(chunk_id: &str) -> Content {
        Content::from(format!("content for {}", chunk_id))
    }
}

#[async_trait]
impl ContentResolver for ScriptedResolver {
    async fn resolve(&self, chunk_id: &str) -> Result<Resolution, BoxError> {
        *self.calls.lock().entry(chunk_id.to_string()).or_default() += 1;

        let step = self
            .scripts
            .lock()
            .get_mut(chunk_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| Step {
                latency: self.latency,
                script: Script::Content(Self::default_content(chunk_id)),
            });

        if !step.latency.is_zero() {
            tokio::time::sleep(step.latency).await;
        }

        match step.script {
            Script::Content(content) => Ok(Resolution::Content(content)),
            Script::Synthetic { content, message } => Ok(Resolution::Synthetic { content, message }),
            Script::Fail(reason) => Err(reason.into()),
            Script::Hang => std::future::pending().await,
        }
    }
}

/// Listener that keeps every event it receives.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ChunkEvent>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ChunkEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn count(&self, pred: impl Fn(&ChunkEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    pub fn loaded_count(&self, chunk_id: &str) -> usize {
        self.count(|e| matches!(e, ChunkEvent::Loaded { .. }) && e.chunk_id() == chunk_id)
    }

    pub fn unloaded_count(&self, chunk_id: &str) -> usize {
        self.count(|e| matches!(e, ChunkEvent::Unloaded { .. }) && e.chunk_id() == chunk_id)
    }

    pub fn error_count(&self, chunk_id: &str) -> usize {
        self.count(|e| e.is_error() && e.chunk_id() == chunk_id)
    }
}

impl ChunkEventListener for RecordingListener {
    fn on_event(&self, event: ChunkEvent) {
        self.events.lock().push(event);
    }
}

struct Observer {
    element: ElementRef,
    options: IntersectionOptions,
    sink: IntersectionSink,
    token: CancellationToken,
}

/// Intersection primitive driven by hand.
#[derive(Default)]
pub struct ManualIntersection {
    observers: Mutex<Vec<Observer>>,
    observe_calls: Mutex<usize>,
}

impl ManualIntersection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `ratio` for `element` to every live observation of it.
    pub fn set_ratio(&self, element: &ElementRef, ratio: f64) {
        self.push(
            element,
            IntersectionEntry {
                is_intersecting: ratio > 0.0,
                ratio,
            },
        );
    }

    pub fn enter(&self, element: &ElementRef) {
        self.push(element, IntersectionEntry::entered());
    }

    pub fn exit(&self, element: &ElementRef) {
        self.push(element, IntersectionEntry::exited());
    }

    pub fn push(&self, element: &ElementRef, entry: IntersectionEntry) {
        let mut observers = self.observers.lock();
        observers.retain(|o| !o.token.is_cancelled());
        for observer in observers.iter().filter(|o| &o.element == element) {
            let _ = observer.sink.send(entry);
        }
    }

    /// Live observations of `element`.
    pub fn active_observers(&self, element: &ElementRef) -> usize {
        self.observers
            .lock()
            .iter()
            .filter(|o| &o.element == element && !o.token.is_cancelled())
            .count()
    }

    /// Options of the newest live observation of `element`.
    pub fn options_for(&self, element: &ElementRef) -> Option<IntersectionOptions> {
        self.observers
            .lock()
            .iter()
            .rev()
            .find(|o| &o.element == element && !o.token.is_cancelled())
            .map(|o| o.options)
    }

    pub fn observe_calls(&self) -> usize {
        *self.observe_calls.lock()
    }
}

impl IntersectionPrimitive for ManualIntersection {
    fn observe(
        &self,
        element: &ElementRef,
        options: IntersectionOptions,
        sink: IntersectionSink,
    ) -> Observation {
        let token = CancellationToken::new();
        *self.observe_calls.lock() += 1;
        self.observers.lock().push(Observer {
            element: element.clone(),
            options,
            sink,
            token: token.clone(),
        });
        Observation::new(token)
    }
}
