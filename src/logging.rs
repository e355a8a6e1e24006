//! Logging utilities with verbose mode support
//!
//! Set VERBOSE=1 or use --verbose flag to enable verbose logging.
//! `RUST_LOG` takes precedence over both when it is set.

use tracing_subscriber::EnvFilter;

/// Whether the environment asks for verbose output
pub fn verbose_from_env() -> bool {
    matches!(std::env::var("VERBOSE").as_deref(), Ok("1") | Ok("true"))
}

/// Install the global tracing subscriber.
///
/// Calling this twice is harmless: the second subscriber is rejected and
/// the first one stays in place.
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Log a message only in verbose mode
#[macro_export]
macro_rules! verbose {
    ($($arg:tt)*) => {
        ::tracing::debug!($($arg)*)
    };
}

/// Log an error message (always shown)
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        ::tracing::error!($($arg)*)
    };
}

/// Log a warning (always shown)
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        ::tracing::warn!($($arg)*)
    };
}

/// Log an important info message (always shown)
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        ::tracing::info!($($arg)*)
    };
}
