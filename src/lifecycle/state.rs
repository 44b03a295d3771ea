//! Pure chunk lifecycle transitions.
//!
//! [`transition`] maps `(state, event)` to the next state plus a list of
//! [`Effect`]s for the driver to carry out (timers, cache writes,
//! notifications). It performs no I/O and reads no clock.

use crate::error::LoadError;
use serde::Serialize;

/// Where a chunk is in its show/hide cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Idle,
    Loading,
    Visible,
    Exiting,
    Error,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Idle => "idle",
            ChunkStatus::Loading => "loading",
            ChunkStatus::Visible => "visible",
            ChunkStatus::Exiting => "exiting",
            ChunkStatus::Error => "error",
        }
    }
}

/// State of one mounted chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkState {
    pub status: ChunkStatus,
    pub retry_count: u32,
    pub last_error: Option<LoadError>,
    /// Latest visibility reported by the sensor.
    pub intersecting: bool,
}

impl Default for ChunkState {
    fn default() -> Self {
        Self {
            status: ChunkStatus::Idle,
            retry_count: 0,
            last_error: None,
            intersecting: false,
        }
    }
}

impl ChunkState {
    /// Whether a retry affordance should be offered.
    pub fn can_retry(&self, max_retries: u32) -> bool {
        self.status == ChunkStatus::Error && self.retry_count < max_retries
    }

    /// Whether content is on screen (fully or fading out).
    pub fn has_content(&self) -> bool {
        matches!(self.status, ChunkStatus::Visible | ChunkStatus::Exiting)
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// The sensor reported a transition. `cached` is whether a live cache
    /// entry exists for the chunk.
    VisibilityChanged { intersecting: bool, cached: bool },
    /// Resolution finished in time. `synthetic` carries the message of a
    /// synthetic completion.
    LoadSucceeded { synthetic: Option<String> },
    /// Resolution failed or timed out.
    LoadFailed(LoadError),
    RetryElapsed,
    UnloadElapsed,
    /// Explicit retry from the owner.
    ManualRetry,
}

/// Side effects requested by a transition, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Show the cached content fetched for this event.
    AdoptCached,
    /// Begin a load attempt (load delay, then resolution, raced against the timeout).
    StartLoad,
    CancelLoad,
    /// Write the resolved content to the cache and show it.
    StoreAndShow,
    NotifyLoaded { from_cache: bool },
    NotifyUnloaded,
    NotifyError { error: LoadError, retry_scheduled: bool },
    NotifySynthetic { message: String },
    ScheduleRetry,
    CancelRetry,
    ScheduleUnload,
    CancelUnload,
    /// Drop the displayed content. The cache entry stays.
    ClearContent,
}

/// Bounds the transition function needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_retries: u32,
}

/// Result of one transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: ChunkState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn stay(state: ChunkState) -> Self {
        Self {
            state,
            effects: Vec::new(),
        }
    }

    /// Whether the status changed.
    pub fn moved(&self, from: &ChunkState) -> bool {
        self.state.status != from.status
    }
}

/// Compute the next state for `event`.
///
/// Entering from `Idle` adopts cached content (`Visible`, "loaded" from
/// cache) or starts a load. Entering while `Exiting` returns to `Visible`
/// and cancels the pending unload without emitting "loaded" again: the
/// content never left the screen, so every `Loaded` stays paired with at
/// most one later `Unloaded`.
pub fn transition(current: &ChunkState, event: LifecycleEvent, limits: &Limits) -> Transition {
    use ChunkStatus::*;

    let mut next = current.clone();
    let mut effects = Vec::new();

    match event {
        LifecycleEvent::VisibilityChanged {
            intersecting,
            cached,
        } => {
            next.intersecting = intersecting;
            match (current.status, intersecting) {
                (Idle, true) if cached => {
                    next.status = Visible;
                    next.last_error = None;
                    effects.push(Effect::AdoptCached);
                    effects.push(Effect::NotifyLoaded { from_cache: true });
                }
                (Idle, true) => {
                    next.status = Loading;
                    next.last_error = None;
                    effects.push(Effect::StartLoad);
                }
                // Content never left the screen; resume without a second "loaded".
                (Exiting, true) => {
                    next.status = Visible;
                    effects.push(Effect::CancelUnload);
                }
                (Visible, false) => {
                    next.status = Exiting;
                    effects.push(Effect::ScheduleUnload);
                }
                // Loading settles against the latest flag; Error waits for a retry.
                _ => {}
            }
        }

        LifecycleEvent::LoadSucceeded { synthetic } => {
            if current.status != Loading {
                return Transition::stay(next);
            }
            next.retry_count = 0;
            next.last_error = None;
            effects.push(Effect::StoreAndShow);
            effects.push(Effect::NotifyLoaded { from_cache: false });
            if let Some(message) = synthetic {
                effects.push(Effect::NotifySynthetic { message });
            }
            if current.intersecting {
                next.status = Visible;
            } else {
                next.status = Exiting;
                effects.push(Effect::ScheduleUnload);
            }
        }

        LifecycleEvent::LoadFailed(error) => {
            if current.status != Loading {
                return Transition::stay(next);
            }
            next.status = Error;
            next.last_error = Some(error.clone());
            let retry_scheduled = current.retry_count < limits.max_retries;
            effects.push(Effect::NotifyError {
                error,
                retry_scheduled,
            });
            if retry_scheduled {
                next.retry_count += 1;
                effects.push(Effect::ScheduleRetry);
            }
        }

        LifecycleEvent::RetryElapsed => {
            if current.status == Error {
                next.status = Loading;
                effects.push(Effect::StartLoad);
            }
        }

        LifecycleEvent::UnloadElapsed => {
            if current.status == Exiting {
                next.status = Idle;
                effects.push(Effect::ClearContent);
                effects.push(Effect::NotifyUnloaded);
            }
        }

        LifecycleEvent::ManualRetry => {
            if current.status == Error {
                next.status = Loading;
                next.retry_count = 0;
                effects.push(Effect::CancelRetry);
                effects.push(Effect::StartLoad);
            }
        }
    }

    Transition {
        state: next,
        effects,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: Limits = Limits { max_retries: 3 };

    fn state(status: ChunkStatus) -> ChunkState {
        ChunkState {
            status,
            ..Default::default()
        }
    }

    fn enter(cached: bool) -> LifecycleEvent {
        LifecycleEvent::VisibilityChanged {
            intersecting: true,
            cached,
        }
    }

    fn exit() -> LifecycleEvent {
        LifecycleEvent::VisibilityChanged {
            intersecting: false,
            cached: false,
        }
    }

    fn failure() -> LoadError {
        LoadError::Failure {
            chunk_id: "c".into(),
            reason: "boom".into(),
        }
    }

    #[test]
    fn test_enter_with_cache_hit_skips_loading() {
        let t = transition(&state(ChunkStatus::Idle), enter(true), &LIMITS);
        assert_eq!(t.state.status, ChunkStatus::Visible);
        assert_eq!(
            t.effects,
            vec![Effect::AdoptCached, Effect::NotifyLoaded { from_cache: true }]
        );
    }

    #[test]
    fn test_enter_without_cache_starts_load() {
        let t = transition(&state(ChunkStatus::Idle), enter(false), &LIMITS);
        assert_eq!(t.state.status, ChunkStatus::Loading);
        assert!(t.state.intersecting);
        assert_eq!(t.effects, vec![Effect::StartLoad]);
    }

    #[test]
    fn test_reenter_while_loading_is_ignored() {
        let mut s = state(ChunkStatus::Loading);
        s.intersecting = true;
        let t = transition(&s, enter(false), &LIMITS);
        assert_eq!(t.state.status, ChunkStatus::Loading);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_success_resets_retries() {
        let mut s = state(ChunkStatus::Loading);
        s.intersecting = true;
        s.retry_count = 2;
        let t = transition(&s, LifecycleEvent::LoadSucceeded { synthetic: None }, &LIMITS);
        assert_eq!(t.state.status, ChunkStatus::Visible);
        assert_eq!(t.state.retry_count, 0);
        assert_eq!(
            t.effects,
            vec![Effect::StoreAndShow, Effect::NotifyLoaded { from_cache: false }]
        );
    }

    #[test]
    fn test_exit_during_load_is_honored_at_settle() {
        let s = state(ChunkStatus::Loading);
        let s = transition(&s, exit(), &LIMITS).state;
        assert_eq!(s.status, ChunkStatus::Loading);

        let t = transition(&s, LifecycleEvent::LoadSucceeded { synthetic: None }, &LIMITS);
        assert_eq!(t.state.status, ChunkStatus::Exiting);
        assert_eq!(t.effects.last(), Some(&Effect::ScheduleUnload));
    }

    #[test]
    fn test_synthetic_success_notifies_both() {
        let mut s = state(ChunkStatus::Loading);
        s.intersecting = true;
        let t = transition(
            &s,
            LifecycleEvent::LoadSucceeded {
                synthetic: Some("placeholder".into()),
            },
            &LIMITS,
        );
        assert!(t.effects.contains(&Effect::NotifySynthetic {
            message: "placeholder".into()
        }));
        assert!(!t
            .effects
            .iter()
            .any(|e| matches!(e, Effect::NotifyError { .. })));
    }

    #[test]
    fn test_failures_retry_until_exhausted() {
        let mut s = state(ChunkStatus::Loading);
        let mut retries = 0;
        for _ in 0..4 {
            let t = transition(&s, LifecycleEvent::LoadFailed(failure()), &LIMITS);
            assert_eq!(t.state.status, ChunkStatus::Error);
            s = t.state;
            if t.effects.contains(&Effect::ScheduleRetry) {
                retries += 1;
                s = transition(&s, LifecycleEvent::RetryElapsed, &LIMITS).state;
            }
        }
        assert_eq!(retries, 3);
        assert_eq!(s.status, ChunkStatus::Error);
        assert_eq!(s.retry_count, 3);
        assert!(!s.can_retry(3));
        assert_eq!(s.last_error, Some(failure()));
    }

    #[test]
    fn test_manual_retry_resets_count() {
        let mut s = state(ChunkStatus::Error);
        s.retry_count = 3;
        let t = transition(&s, LifecycleEvent::ManualRetry, &LIMITS);
        assert_eq!(t.state.status, ChunkStatus::Loading);
        assert_eq!(t.state.retry_count, 0);
        assert_eq!(t.effects, vec![Effect::CancelRetry, Effect::StartLoad]);

        let t = transition(&state(ChunkStatus::Visible), LifecycleEvent::ManualRetry, &LIMITS);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_visible_exit_unload_cycle() {
        let mut s = state(ChunkStatus::Visible);
        s.intersecting = true;
        let t = transition(&s, exit(), &LIMITS);
        assert_eq!(t.state.status, ChunkStatus::Exiting);
        assert_eq!(t.effects, vec![Effect::ScheduleUnload]);

        let t = transition(&t.state, LifecycleEvent::UnloadElapsed, &LIMITS);
        assert_eq!(t.state.status, ChunkStatus::Idle);
        assert_eq!(t.effects, vec![Effect::ClearContent, Effect::NotifyUnloaded]);
    }

    #[test]
    fn test_reenter_while_exiting_cancels_unload() {
        let t = transition(&state(ChunkStatus::Exiting), enter(true), &LIMITS);
        assert_eq!(t.state.status, ChunkStatus::Visible);
        assert_eq!(t.effects, vec![Effect::CancelUnload]);
    }

    #[test]
    fn test_stale_events_are_ignored() {
        for status in [ChunkStatus::Idle, ChunkStatus::Visible, ChunkStatus::Error] {
            let s = state(status);
            let t = transition(&s, LifecycleEvent::LoadSucceeded { synthetic: None }, &LIMITS);
            assert_eq!(t.state, s);
            assert!(t.effects.is_empty());
        }
        let t = transition(&state(ChunkStatus::Visible), LifecycleEvent::UnloadElapsed, &LIMITS);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_can_retry() {
        let mut s = state(ChunkStatus::Error);
        assert!(s.can_retry(3));
        s.retry_count = 3;
        assert!(!s.can_retry(3));
        assert!(!state(ChunkStatus::Idle).can_retry(3));
    }
}
