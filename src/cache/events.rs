//! Debounced cache status notifications.
//!
//! Every cache mutation publishes a fresh [`CacheStatusSnapshot`]. Publishes
//! are micro-batched: the first one in a burst schedules a flush on the next
//! scheduler tick, later ones just replace the pending snapshot. A flush
//! delivers the latest snapshot only if it differs from the last delivered
//! one. Each listener runs isolated: an error or panic is logged and counted
//! and the remaining listeners still receive the update.

use crate::error::ListenerError;
use crate::metrics::{CacheMetrics, ERROR_LISTENER};
use crate::types::CacheStatusSnapshot;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Callback receiving cache status updates.
pub type StatusListener =
    Arc<dyn Fn(&CacheStatusSnapshot) -> Result<(), ListenerError> + Send + Sync + 'static>;

/// Pub/sub over cache status changes.
#[derive(Clone)]
pub struct CacheEventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    listeners: RwLock<BTreeMap<u64, StatusListener>>,
    next_id: AtomicU64,
    pending: Mutex<Option<CacheStatusSnapshot>>,
    last_delivered: Mutex<CacheStatusSnapshot>,
    // Serializes flushes so snapshots are delivered in publish order.
    delivery: ReentrantMutex<()>,
    metrics: Arc<CacheMetrics>,
}

impl CacheEventBus {
    /// Create a bus; `initial` is treated as already delivered.
    pub fn new(initial: CacheStatusSnapshot, metrics: Arc<CacheMetrics>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                pending: Mutex::new(None),
                last_delivered: Mutex::new(initial),
                delivery: ReentrantMutex::new(()),
                metrics,
            }),
        }
    }

    /// Register a listener. It stays registered until [`Subscription::unsubscribe`].
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&CacheStatusSnapshot) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.write().insert(id, Arc::new(listener));
        debug!(listener_id = id, "Cache status listener subscribed");
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// Queue a snapshot for delivery on the next tick.
    ///
    /// Outside a tokio runtime the snapshot is delivered immediately.
    pub fn publish(&self, status: CacheStatusSnapshot) {
        let schedule = {
            let mut pending = self.inner.pending.lock();
            let was_idle = pending.is_none();
            *pending = Some(status);
            was_idle
        };
        if !schedule {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = self.inner.clone();
                handle.spawn(async move {
                    tokio::task::yield_now().await;
                    inner.flush();
                });
            }
            Err(_) => self.inner.flush(),
        }
    }

    /// Deliver any pending snapshot now.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// The last snapshot handed to listeners.
    pub fn last_delivered(&self) -> CacheStatusSnapshot {
        self.inner.last_delivered.lock().clone()
    }
}

impl std::fmt::Debug for CacheEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl BusInner {
    fn flush(&self) {
        let _delivery = self.delivery.lock();

        let Some(status) = self.pending.lock().take() else {
            return;
        };
        {
            let mut last = self.last_delivered.lock();
            if *last == status {
                return;
            }
            *last = status.clone();
        }

        let listeners: Vec<(u64, StatusListener)> = self
            .listeners
            .read()
            .iter()
            .map(|(id, l)| (*id, l.clone()))
            .collect();

        debug!(
            size = status.size,
            listeners = listeners.len(),
            "Delivering cache status"
        );

        for (id, listener) in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(&status)));
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.with_id(id),
                Err(panic) => ListenerError::Panicked {
                    id,
                    reason: panic_message(panic.as_ref()),
                },
            };
            warn!(listener_id = id, error = %error, "Cache status listener failed");
            self.metrics.record_error(ERROR_LISTENER);
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle returned by [`CacheEventBus::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the listener. Returns false if the bus is gone.
    pub fn unsubscribe(self) -> bool {
        match self.bus.upgrade() {
            Some(bus) => bus.listeners.write().remove(&self.id).is_some(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    fn status(keys: &[&str]) -> CacheStatusSnapshot {
        CacheStatusSnapshot {
            size: keys.len(),
            max_size: 5,
            keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    fn bus() -> (CacheEventBus, Arc<CacheMetrics>) {
        let metrics = Arc::new(CacheMetrics::new());
        (CacheEventBus::new(status(&[]), metrics.clone()), metrics)
    }

    fn recorder(bus: &CacheEventBus) -> (Arc<PlMutex<Vec<CacheStatusSnapshot>>>, Subscription) {
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = bus.subscribe(move |s| {
            sink.lock().push(s.clone());
            Ok(())
        });
        (seen, sub)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_into_one_delivery() {
        let (bus, _) = bus();
        let (seen, _sub) = recorder(&bus);

        bus.publish(status(&["a"]));
        bus.publish(status(&["a", "b"]));
        bus.publish(status(&["a", "b", "c"]));
        assert!(seen.lock().is_empty());

        tokio::time::sleep(std::time::Duration::from_millis(1)).await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], status(&["a", "b", "c"]));
    }

    #[test]
    fn test_unchanged_snapshot_not_redelivered() {
        let (bus, _) = bus();
        let (seen, _sub) = recorder(&bus);

        // No runtime: delivered synchronously.
        bus.publish(status(&["a"]));
        bus.publish(status(&["a"]));
        bus.publish(status(&[]));

        assert_eq!(seen.lock().len(), 2);
        assert_eq!(bus.last_delivered(), status(&[]));
    }

    #[test]
    fn test_initial_state_is_not_delivered() {
        let (bus, _) = bus();
        let (seen, _sub) = recorder(&bus);
        bus.publish(status(&[]));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_failing_listeners_are_isolated() {
        let (bus, metrics) = bus();
        let _bad = bus.subscribe(|_| Err(ListenerError::failed("rejected")));
        let _panicky = bus.subscribe(|_| panic!("listener blew up"));
        let (seen, _sub) = recorder(&bus);

        bus.publish(status(&["a"]));

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(metrics.errors.get([ERROR_LISTENER]), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let (bus, _) = bus();
        let (seen, sub) = recorder(&bus);
        assert_eq!(bus.listener_count(), 1);

        assert!(sub.unsubscribe());
        assert_eq!(bus.listener_count(), 0);

        bus.publish(status(&["a"]));
        assert!(seen.lock().is_empty());
    }
}
