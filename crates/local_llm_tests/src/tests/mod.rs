use std::sync::Once;

use tracing_subscriber::EnvFilter;

mod client;
mod encoding;
mod generation;
mod tools;

/// Installs a test-friendly subscriber honouring `RUST_LOG`, once per process.
pub(crate) fn init_tracing() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
