//! Development-time tracing.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted and not read by the agent.
//!
//! - **Progress log (`io/progress_log`)**: product artifact appended to the
//!   project's progress file. Always written, unaffected by `RUST_LOG`.
//!
//! - **Agent transcripts**: `.autoloop/iterations/<n>/agent.log`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warn` if unset; `--verbose` raises the
/// default to `info`. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=autoloop=debug autoloop run
/// ```
pub fn init(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
