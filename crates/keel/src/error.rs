//! Top-level error type.

use keel_migrate::MigrationError;
use keel_pool::PoolError;
use thiserror::Error;

/// Errors surfaced by the composition root.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Missing or invalid configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Pool error: connectivity, timeout or closed pool.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// A migration failed. Fatal to boot.
    #[error(transparent)]
    Migration(#[from] MigrationError),
}

impl Error {
    /// Whether this error must abort startup.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Config(_) | Self::Migration(_) => true,
            Self::Pool(e) => matches!(e, PoolError::Config(_) | PoolError::Connection { .. }),
        }
    }
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Config("missing DB_HOST".into()).is_fatal());
        assert!(!Error::Pool(PoolError::Timeout(Duration::from_secs(2))).is_fatal());
        assert!(!Error::Pool(PoolError::PoolClosed).is_fatal());
        assert!(
            Error::Migration(MigrationError::InvalidDefinition("dup".into())).is_fatal()
        );
    }
}
