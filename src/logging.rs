//! Logging setup
//!
//! The stack itself only emits `tracing` events; installing a subscriber
//! is the embedding application's choice. [`init`] is a convenience for
//! binaries that just want readable output on stderr.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install a global `tracing` subscriber for the stack.
///
/// Honors `RUST_LOG`; without it, defaults to `tapstack=info`. Safe to
/// call more than once, and a no-op if another subscriber is already
/// installed.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("tapstack=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init();
    });
}
