//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Install a console subscriber filtered at `level`; `RUST_LOG` overrides it.
///
/// Safe to call more than once: later calls are no-ops.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
