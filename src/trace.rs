//! Optional trace output, compiled in with the `tracing` feature.
//!
//! The buffers emit events on segment growth, recycling, and fd-loop
//! termination. Without the feature the macros below expand to nothing, so
//! the hot paths carry no logging cost by default.

/// Install a subscriber for the crate's trace output.
///
/// Honors `RUST_LOG` when set; otherwise segment lifecycle events come
/// through at trace level and the fd loops at debug. Thread names are
/// included because almost every event here is only meaningful relative to
/// which side of the pipe emitted it. Safe to call from multiple tests;
/// later calls lose the race and are ignored.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("bytepipe::spsc=trace,bytepipe=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .compact()
        .try_init()
        .ok();
}

// When tracing is enabled, re-export macros from the tracing crate.
#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, trace};

// When tracing is disabled, provide no-op macro implementations.
#[cfg(not(feature = "tracing"))]
macro_rules! trace_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use debug_noop as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use trace_noop as trace;
