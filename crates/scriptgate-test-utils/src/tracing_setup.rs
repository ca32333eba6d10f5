//! Tracing initialisation for tests.

use tracing_subscriber::EnvFilter;

/// Install a subscriber on the test-harness writer, honouring `RUST_LOG`
/// (default `warn`). Idempotent.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
