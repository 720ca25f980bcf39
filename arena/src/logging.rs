//! Diagnostic tracing for arena processes.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Operator diagnostics via `RUST_LOG`, output
//!   to stderr. Not persisted.
//!
//! - **Event log (`io/journal`)** and **artifacts (`io/artifacts`)**: Product
//!   output under the state directory. Always written, unaffected by
//!   `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter for the `arena` CLI.
pub const CLI_FILTER: &str = "warn";

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; falls back to `default_filter` when unset or invalid.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=arena=debug arena work --once
/// ```
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
