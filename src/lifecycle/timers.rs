//! Cancelable timers owned by one chunk lifecycle.
//!
//! Each kind has a single slot. Starting a timer aborts whatever occupied
//! its slot and bumps the slot generation; a firing timer reports its
//! generation so the driver can drop anything that was superseded between
//! the timer waking and the driver handling it.

use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Load delay plus resolution, raced against the timeout.
    Load,
    Retry,
    Unload,
}

impl TimerKind {
    const ALL: [TimerKind; 3] = [TimerKind::Load, TimerKind::Retry, TimerKind::Unload];

    fn index(self) -> usize {
        match self {
            TimerKind::Load => 0,
            TimerKind::Retry => 1,
            TimerKind::Unload => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimerKind::Load => "load",
            TimerKind::Retry => "retry",
            TimerKind::Unload => "unload",
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

#[derive(Debug)]
pub struct TimerSet {
    slots: [Slot; 3],
    token: CancellationToken,
}

impl TimerSet {
    /// Timers stop when `parent` is cancelled.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            slots: Default::default(),
            token: parent.child_token(),
        }
    }

    /// Start a timer of `kind`, replacing any pending one.
    ///
    /// `make` receives the new generation and builds the task body.
    pub fn start<F, Fut>(&mut self, kind: TimerKind, make: F) -> u64
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        let slot = &mut self.slots[kind.index()];
        if let Some(previous) = slot.handle.take() {
            previous.abort();
        }
        slot.generation += 1;
        let body = make(slot.generation);
        slot.handle = Some(tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = body => {}
            }
        }));
        slot.generation
    }

    /// Cancel the pending timer of `kind`, if any.
    pub fn cancel(&mut self, kind: TimerKind) {
        let slot = &mut self.slots[kind.index()];
        if let Some(handle) = slot.handle.take() {
            handle.abort();
        }
        slot.generation += 1;
    }

    /// Whether `generation` is the live timer of `kind`.
    pub fn is_current(&self, kind: TimerKind, generation: u64) -> bool {
        let slot = &self.slots[kind.index()];
        slot.handle.is_some() && slot.generation == generation
    }

    /// Mark the live timer of `kind` as fired. Returns false if `generation`
    /// was superseded.
    pub fn complete(&mut self, kind: TimerKind, generation: u64) -> bool {
        if !self.is_current(kind, generation) {
            return false;
        }
        self.slots[kind.index()].handle = None;
        true
    }

    pub fn is_pending(&self, kind: TimerKind) -> bool {
        self.slots[kind.index()]
            .handle
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn pending(&self) -> Vec<TimerKind> {
        TimerKind::ALL
            .into_iter()
            .filter(|k| self.is_pending(*k))
            .collect()
    }

    /// Cancel every timer at once. The set stays unusable afterwards.
    pub fn cancel_all(&mut self) {
        self.token.cancel();
        for kind in TimerKind::ALL {
            self.cancel(kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn counting(fired: &Arc<AtomicUsize>, delay: Duration) -> impl Future<Output = ()> + Send + 'static {
        let fired = fired.clone();
        async move {
            tokio::time::sleep(delay).await;
            fired.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_pending_timer() {
        let root = CancellationToken::new();
        let mut timers = TimerSet::new(&root);
        let fired = Arc::new(AtomicUsize::new(0));

        let first = timers.start(TimerKind::Load, |_| counting(&fired, Duration::from_millis(100)));
        let second = timers.start(TimerKind::Load, |_| counting(&fired, Duration::from_millis(100)));
        assert_ne!(first, second);
        assert!(!timers.is_current(TimerKind::Load, first));
        assert!(timers.is_current(TimerKind::Load, second));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_stops_everything() {
        let root = CancellationToken::new();
        let mut timers = TimerSet::new(&root);
        let fired = Arc::new(AtomicUsize::new(0));

        for kind in [TimerKind::Load, TimerKind::Retry, TimerKind::Unload] {
            timers.start(kind, |_| counting(&fired, Duration::from_millis(50)));
        }
        assert_eq!(timers.pending().len(), 3);

        timers.cancel_all();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(timers.pending().is_empty());
    }

    #[tokio::test]
    async fn test_complete_rejects_superseded_generation() {
        let root = CancellationToken::new();
        let mut timers = TimerSet::new(&root);
        let gen = timers.start(TimerKind::Unload, |_| async {});
        timers.cancel(TimerKind::Unload);
        assert!(!timers.complete(TimerKind::Unload, gen));

        let gen = timers.start(TimerKind::Unload, |_| async {});
        assert!(timers.complete(TimerKind::Unload, gen));
        assert!(!timers.complete(TimerKind::Unload, gen));
    }
}
