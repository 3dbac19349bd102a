use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding the log filter for every vramcap component.
pub const LOG_ENV: &str = "VRAMCAP_LOG";

/// Initialize structured logging with environment filter.
/// Set VRAMCAP_LOG=debug (or trace, info, warn, error) for verbosity control.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Logging for the preloaded library.
///
/// Writes to stderr so the host application's stdout is left alone, defaults
/// to `warn`, and never replaces a subscriber that is already installed.
pub fn init_preload_logging() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();
}
