//! Diagnostic tracing for the controller.
//!
//! Tracing goes to stderr and is filtered by `RUST_LOG`. Per-turn artifacts
//! under `.iterctl/iterations/` are written by `io::iteration_log` regardless
//! of the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the stderr subscriber. Defaults to `warn` when `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=iterctl=debug iterctl run
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
