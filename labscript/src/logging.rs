//! Diagnostic tracing for both binaries.
//!
//! Tracing goes to stderr and is filtered by `RUST_LOG`. It is separate from
//! iteration events (`io/reporter`), which reach their sinks regardless of the
//! filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used by the CLI when `RUST_LOG` is unset.
pub const CLI_DEFAULT_FILTER: &str = "warn";

/// Initialize compact stderr tracing for the CLI.
///
/// ```bash
/// RUST_LOG=labscript=debug labscript simulate protocol.py
/// ```
pub fn init() {
    init_with(CLI_DEFAULT_FILTER);
}

/// Initialize compact stderr tracing, falling back to `default_filter` when
/// `RUST_LOG` is unset or unparsable.
pub fn init_with(default_filter: &str) {
    tracing_subscriber::registry()
        .with(filter_or(default_filter))
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

fn filter_or(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}
