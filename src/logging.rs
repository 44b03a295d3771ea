//! Tracing subscriber setup for binaries and demos embedding the crate.
//!
//! The library itself only emits `tracing` events:
//!
//! - `info`: start/stop, snapshot restore and save
//! - `debug`: sweeps, evictions, chunk transitions
//! - `warn`: absorbed failures (snapshot I/O, listener errors)
//!
//! `RUST_LOG` overrides the default filter, e.g.
//! `RUST_LOG=chunkcull=debug` or `RUST_LOG=chunkcull::cache=trace`.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default directive when `RUST_LOG` is unset.
pub fn default_directive() -> &'static str {
    if cfg!(debug_assertions) {
        "chunkcull=debug"
    } else {
        "chunkcull=info"
    }
}

/// Install a compact global subscriber. Later calls are no-ops.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive()));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).compact())
        .try_init();
}

/// Like [`init`], for tests: output goes through the test harness capture.
pub fn init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("chunkcull=debug"))
        .with(fmt::layer().with_test_writer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_for_tests();
        init_for_tests();
        init();
        tracing::debug!("logging initialised");
    }

    #[test]
    fn test_default_directive_targets_crate() {
        assert!(default_directive().starts_with("chunkcull="));
    }
}
