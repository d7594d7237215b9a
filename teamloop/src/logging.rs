//! Development-time tracing for debugging a pipeline run.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of the run output.
//!
//! - **Run log (`io/run_log`)**: Product artifact in `logs/run_<id>.jsonl`.
//!   Written unless `--no-log` is given, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing subscriber for development logging.
///
/// Reads `RUST_LOG` env var. Defaults to `warn` if unset, or to `info` for this
/// crate when `verbose` is set. Output: stderr, compact format, no targets.
///
/// A second call is a no-op, so tests and the binary can both call it.
///
/// # Example
/// ```bash
/// RUST_LOG=teamloop=debug teamloop run "a snake game"
/// teamloop --verbose run "a snake game"
/// ```
pub fn init(verbose: bool) {
    let default_directive = if verbose { "warn,teamloop=info" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .try_init();
}
