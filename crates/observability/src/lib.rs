//! Tracing/logging initialization.
//!
//! JSON logs with timestamps, filtered via `RUST_LOG`. Kept minimal; this
//! can evolve into layered exporters and correlation IDs later.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops). The service
/// name is emitted once so multi-process log streams are attributable.
pub fn init(service: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();

    tracing::info!(service, "tracing initialized");
}
