//! Visibility sensing for chunk elements.
//!
//! [`VisibilitySensor`] wraps a host-provided [`IntersectionPrimitive`]
//! (the thing that actually measures element/viewport overlap) and turns its
//! stream of intersection ratios into enter/exit transitions. The root margin
//! is picked from a breakpoint table by viewport width and re-evaluated on
//! a debounced resize, recreating the underlying observation when the margin
//! changes.

mod margin;

pub use margin::{margin_css, resolve_margin, MarginBreakpoint};

use crate::config::ObserverOptions;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Opaque handle to an element the host can observe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementRef(Arc<str>);

impl ElementRef {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ElementRef {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Options handed to the primitive for one observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntersectionOptions {
    pub root_margin_px: u32,
    pub threshold: f64,
}

/// One intersection measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntersectionEntry {
    pub is_intersecting: bool,
    /// Visible fraction of the element, `0.0..=1.0`.
    pub ratio: f64,
}

impl IntersectionEntry {
    pub fn entered() -> Self {
        Self {
            is_intersecting: true,
            ratio: 1.0,
        }
    }

    pub fn exited() -> Self {
        Self {
            is_intersecting: false,
            ratio: 0.0,
        }
    }

    /// Whether this measurement counts as visible at `threshold`.
    pub fn is_visible(&self, threshold: f64) -> bool {
        self.is_intersecting && self.ratio >= threshold
    }
}

/// Channel a primitive pushes measurements into.
pub type IntersectionSink = mpsc::UnboundedSender<IntersectionEntry>;

/// A live observation. Disconnects when cancelled or dropped.
#[derive(Debug)]
pub struct Observation {
    token: CancellationToken,
}

impl Observation {
    /// Wrap the token the primitive watches to stop reporting.
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn disconnect(&self) {
        self.token.cancel();
    }

    pub fn is_connected(&self) -> bool {
        !self.token.is_cancelled()
    }
}

impl Drop for Observation {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Host seam measuring element/viewport intersection.
pub trait IntersectionPrimitive: Send + Sync + 'static {
    /// Start reporting measurements for `element` into `sink` until the
    /// returned observation is disconnected.
    fn observe(
        &self,
        element: &ElementRef,
        options: IntersectionOptions,
        sink: IntersectionSink,
    ) -> Observation;
}

/// Callback receiving enter (`true`) and exit (`false`) transitions.
pub type VisibilityCallback = Arc<dyn Fn(bool) + Send + Sync + 'static>;

/// Emits enter/exit transitions for one element.
pub struct VisibilitySensor {
    shared: Arc<Shared>,
}

struct Shared {
    primitive: Arc<dyn IntersectionPrimitive>,
    options: ObserverOptions,
    visible: AtomicBool,
    connections: AtomicU64,
    state: Mutex<SensorState>,
}

struct SensorState {
    viewport_width: u32,
    margin_px: u32,
    target: Option<Target>,
    resize: Option<JoinHandle<()>>,
}

struct Target {
    element: ElementRef,
    on_change: VisibilityCallback,
    connection: Option<Connection>,
}

struct Connection {
    observation: Observation,
    pump: JoinHandle<()>,
}

impl Connection {
    fn close(self) {
        self.observation.disconnect();
        self.pump.abort();
    }
}

impl VisibilitySensor {
    pub fn new(
        primitive: Arc<dyn IntersectionPrimitive>,
        options: ObserverOptions,
        viewport_width: u32,
    ) -> Self {
        let margin_px = resolve_margin(
            &options.breakpoints,
            viewport_width,
            options.default_margin_px,
        );
        Self {
            shared: Arc::new(Shared {
                primitive,
                options,
                visible: AtomicBool::new(false),
                connections: AtomicU64::new(0),
                state: Mutex::new(SensorState {
                    viewport_width,
                    margin_px,
                    target: None,
                    resize: None,
                }),
            }),
        }
    }

    /// Start observing `element`, replacing any previous target.
    ///
    /// `None` is a no-op. Must be called inside a tokio runtime.
    pub fn attach<F>(&self, element: Option<ElementRef>, on_change: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let Some(element) = element else {
            debug!("No element to observe");
            return;
        };

        let mut state = self.shared.state.lock();
        if let Some(previous) = state.target.take() {
            if let Some(conn) = previous.connection {
                conn.close();
            }
        }
        self.shared.visible.store(false, Ordering::SeqCst);

        let mut target = Target {
            element,
            on_change: Arc::new(on_change),
            connection: None,
        };
        target.connection = Some(Shared::connect(&self.shared, &target, state.margin_px));
        debug!(element = %target.element, margin_px = state.margin_px, "Visibility sensor attached");
        state.target = Some(target);
    }

    /// Stop observing. Pending resize work is dropped.
    pub fn detach(&self) {
        let mut state = self.shared.state.lock();
        if let Some(resize) = state.resize.take() {
            resize.abort();
        }
        if let Some(target) = state.target.take() {
            if let Some(conn) = target.connection {
                conn.close();
            }
            debug!(element = %target.element, "Visibility sensor detached");
        }
    }

    /// Report a viewport resize. The margin is re-evaluated once the width
    /// has been stable for the configured update interval.
    pub fn viewport_resized(&self, width: u32) {
        let delay = self.shared.options.update_interval;
        let weak = Arc::downgrade(&self.shared);

        let mut state = self.shared.state.lock();
        if let Some(pending) = state.resize.take() {
            pending.abort();
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                state.resize = Some(handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(shared) = weak.upgrade() {
                        Shared::apply_width(&shared, width);
                    }
                }));
            }
            Err(_) => {
                drop(state);
                Shared::apply_width(&self.shared, width);
            }
        }
    }

    /// Margin currently applied, in pixels.
    pub fn current_margin(&self) -> u32 {
        self.shared.state.lock().margin_px
    }

    pub fn viewport_width(&self) -> u32 {
        self.shared.state.lock().viewport_width
    }

    pub fn is_attached(&self) -> bool {
        self.shared.state.lock().target.is_some()
    }

    /// Last reported visibility.
    pub fn is_visible(&self) -> bool {
        self.shared.visible.load(Ordering::SeqCst)
    }

    /// Number of observations created so far.
    pub fn connection_count(&self) -> u64 {
        self.shared.connections.load(Ordering::Relaxed)
    }
}

impl Drop for VisibilitySensor {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for VisibilitySensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("VisibilitySensor")
            .field("viewport_width", &state.viewport_width)
            .field("margin_px", &state.margin_px)
            .field("attached", &state.target.is_some())
            .finish()
    }
}

impl Shared {
    fn connect(this: &Arc<Self>, target: &Target, margin_px: u32) -> Connection {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let options = IntersectionOptions {
            root_margin_px: margin_px,
            threshold: this.options.threshold,
        };
        let observation = this.primitive.observe(&target.element, options, tx);
        this.connections.fetch_add(1, Ordering::Relaxed);

        let weak: Weak<Self> = Arc::downgrade(this);
        let on_change = target.on_change.clone();
        let pump = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                let Some(shared) = weak.upgrade() else { break };
                shared.deliver(entry, &on_change);
            }
        });

        Connection { observation, pump }
    }

    fn deliver(&self, entry: IntersectionEntry, on_change: &VisibilityCallback) {
        let visible = entry.is_visible(self.options.threshold);
        if self.visible.swap(visible, Ordering::SeqCst) != visible {
            on_change(visible);
        }
    }

    fn apply_width(this: &Arc<Self>, width: u32) {
        let mut state = this.state.lock();
        state.resize = None;
        state.viewport_width = width;

        let margin_px = resolve_margin(
            &this.options.breakpoints,
            width,
            this.options.default_margin_px,
        );
        if margin_px == state.margin_px {
            return;
        }
        debug!(width, margin_px, "Viewport margin changed");
        state.margin_px = margin_px;

        if let Some(target) = state.target.as_mut() {
            if let Some(old) = target.connection.take() {
                old.close();
            }
            target.connection = Some(Shared::connect(this, target, margin_px));
        }
    }
}
