//! Shared helpers for unit tests.

use tracing_subscriber::EnvFilter;

/// Installs a test-writer subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to debug output for this crate.
pub(crate) fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,blobsync=debug,sqlx=warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
