// Tracing initialization for binaries and tests embedding the cache.
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LoggingConfig;

pub fn init_tracing() {
    init_tracing_with_level("info");
}

/// Installs the fmt subscriber at the configured level.
pub fn init_tracing_from_config(logging: &LoggingConfig) {
    init_tracing_with_level(&logging.level);
}

pub fn init_tracing_with_level(level: &str) {
    let filter = build_filter(std::env::var("RUST_LOG").ok(), level);

    // A subscriber may already be installed by the host application.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

/// Prefer RUST_LOG when it parses, otherwise use the provided level string.
fn build_filter(rust_log: Option<String>, level: &str) -> EnvFilter {
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(level))
}
