//! Logging utilities for core-wide output to stdout.
//!

// Re-exports for convenience
pub use tracing::metadata::LevelFilter;
pub use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, util::SubscriberInitExt};

/// Set up basic logging.
///
/// The caller can specify a log level via `level`; without one we default
/// to "info". Either is overridden by a `RUST_LOG` env var (such as for
/// testing).
pub fn setup(
    level: Option<LevelFilter>,
) -> reload::Handle<tracing_subscriber::EnvFilter, tracing_subscriber::Registry> {
    let level_filter = level.unwrap_or(LevelFilter::INFO);

    let env = std::env::var("RUST_LOG").unwrap_or_else(|_| level_filter.to_string());

    let (filter, reload_handle) = reload::Layer::new(tracing_subscriber::EnvFilter::new(env));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    debug!("logging set up");
    reload_handle
}

/// Update the global logging level on a handle returned by [`setup`].
pub fn update_filter_level(
    reload_handle: reload::Handle<tracing_subscriber::EnvFilter, tracing_subscriber::Registry>,
    level: Option<LevelFilter>,
) {
    let level_filter = level.unwrap_or(LevelFilter::INFO);

    let env = std::env::var("RUST_LOG").unwrap_or_else(|_| level_filter.to_string());

    let res = reload_handle.modify(|filter| *filter = tracing_subscriber::EnvFilter::new(&env));

    match res {
        Ok(_) => debug!("logging filter set to: {}", &env),
        Err(e) => error!("failed to update logging level: {}", e),
    }
}
