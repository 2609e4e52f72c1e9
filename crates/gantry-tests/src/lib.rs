//! Integration test infrastructure for Gantry.

pub mod fixtures;

use once_cell::sync::Lazy;

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
});

/// Install the test tracing subscriber once per process.
pub fn init_tracing() {
    Lazy::force(&TRACING);
}
