//! Diagnostic tracing for the autopilot.
//!
//! Tracing goes to stderr and is filtered by `RUST_LOG`. Profiler span
//! timings log under the `autopilot::profiler` target, so
//! `RUST_LOG=autopilot::profiler=info` shows only timings.
//!
//! Task archives (`io/archive`) are the persisted record and are unaffected by
//! `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warn` if unset. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=autopilot=debug autopilot dispatch "pyautogui.press('enter')"
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
