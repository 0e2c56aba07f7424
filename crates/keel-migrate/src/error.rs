//! Migration error types.

use std::path::PathBuf;

use keel_pool::{BoxError, PoolError};
use thiserror::Error;

/// Errors that can occur while applying migrations.
///
/// Every variant is fatal to boot: a process must not serve traffic with a
/// schema in an unknown state.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MigrationError {
    /// A migration's statements failed; its transaction was rolled back.
    #[error("migration '{name}' failed: {source}")]
    Failed {
        /// Name of the failed migration.
        name: String,
        /// Underlying database error.
        #[source]
        source: BoxError,
    },

    /// An applied migration's SQL changed since it was recorded.
    #[error("migration '{name}' was modified after it was applied (recorded {recorded}, now {current})")]
    ChecksumMismatch {
        /// Name of the drifted migration.
        name: String,
        /// Checksum stored in the ledger.
        recorded: String,
        /// Checksum of the current definition.
        current: String,
    },

    /// The ledger could not be created, read or written.
    #[error("migration ledger error: {0}")]
    Ledger(#[source] BoxError),

    /// No connection could be acquired.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// A migration definition or ledger table name is not usable.
    #[error("invalid migration definition: {0}")]
    InvalidDefinition(String),

    /// A migration file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// File or directory that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl MigrationError {
    pub(crate) fn ledger<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Ledger(Box::new(err))
    }

    pub(crate) fn failed<E>(name: &str, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Failed {
            name: name.to_string(),
            source: Box::new(err),
        }
    }
}
