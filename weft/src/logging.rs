//! Logging initialization.
//!
//! Thin wrapper over `tracing-subscriber`: honors `RUST_LOG` when set,
//! otherwise falls back to the supplied default filter. Binaries call
//! [`init_logging`] once at startup; tests use [`try_init_logging`] so
//! repeated init attempts are harmless.

use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber.
///
/// # Panics
///
/// Panics if a subscriber is already installed; binaries should call this
/// exactly once.
pub fn init_logging(default_filter: &str) {
    try_init_logging(default_filter).expect("logging already initialized");
}

/// Like [`init_logging`], but returns an error instead of panicking when a
/// subscriber is already installed.
pub fn try_init_logging(
    default_filter: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).try_init()
}
