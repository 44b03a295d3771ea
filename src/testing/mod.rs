//! Test doubles for driving chunks without a real viewport or backend.
//!
//! - [`ScriptedResolver`] replays queued outcomes (content, synthetic
//!   content, failures, hangs) with optional latency
//! - [`RecordingListener`] keeps every [`ChunkEvent`](crate::lifecycle::ChunkEvent)
//! - [`ManualIntersection`] is an intersection primitive moved by hand
//! - [`ManualClock`] only advances when told to
//!
//! Pair them with `#[tokio::test(start_paused = true)]` so load, retry and
//! unload delays elapse instantly and deterministically.
//!
//! # Example
//!
//! ```rust,no_run
//! use chunkcull::testing::{ManualIntersection, RecordingListener, Script, ScriptedResolver};
//! use chunkcull::visibility::ElementRef;
//!
//! let resolver = ScriptedResolver::new();
//! resolver.fail_times("gallery", 2, "backend unavailable");
//! resolver.push("gallery", Script::Content("<img src=a.png>".into()));
//!
//! let primitive = ManualIntersection::new();
//! primitive.enter(&ElementRef::new("gallery"));
//!
//! let listener = RecordingListener::new();
//! assert!(listener.events().is_empty());
//! ```

mod doubles;

pub use crate::clock::ManualClock;
pub use doubles::{ManualIntersection, RecordingListener, Script, ScriptedResolver};
