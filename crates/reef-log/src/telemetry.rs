//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Console subscriber filtered by `RUST_LOG` (default `level`).
///
/// Returns `false` if a global subscriber was already installed.
pub fn init(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}

/// Subscriber for tests: writes through the test harness capture and
/// tolerates being called from every test.
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
