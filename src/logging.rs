//! provides logging helpers

use tracing_subscriber::filter;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::{prelude::*, registry};

/// initiate the global tracing subscriber
///
/// Honors `RUST_LOG`, defaulting to INFO. Calling it again is a no-op.
pub fn init() {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    let fmt_layer = layer()
        .with_writer(std::io::stdout)
        .with_target(true)
        .with_filter(env_filter);

    let _ = registry().with(fmt_layer).try_init();
}
