//! Tracing initialisation for binaries.
//!
//! Libraries in this workspace only emit `tracing` events; installing a
//! subscriber is left to the process.
//!
//! ```text
//! RUST_LOG=keel_pool=debug keel check   # fine-grained filter
//! keel --debug check                    # debug unless RUST_LOG is set
//! ```

use keel_pool::BoxError;
use tracing_subscriber::EnvFilter;

/// Tracing options.
#[derive(Debug, Clone, Default)]
pub struct TracingConfig {
    /// Default to `debug` instead of `info` when `RUST_LOG` is unset.
    pub debug: bool,
}

/// Install a console subscriber filtered by `RUST_LOG`.
pub fn init_tracing(config: &TracingConfig) -> Result<(), BoxError> {
    let default = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.debug)
        .compact()
        .try_init()
}
