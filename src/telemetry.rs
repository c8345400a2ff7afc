//! Logging initialization.
//!
//! Plain tracing-subscriber fmt output with an env-filter; RUST_LOG
//! overrides the configured default level.

use tracing_subscriber::EnvFilter;

pub fn init_logging(default_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}
