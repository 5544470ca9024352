//! Process-wide `tracing` setup.
//!
//! `RUST_LOG` wins over the filter passed in; both use `EnvFilter` syntax,
//! e.g. `info,appvisor::output=debug` to echo captured worker output.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

/// Installs a registry with an env filter and a fmt layer.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(default_filter: &str) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
}
