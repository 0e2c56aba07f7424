//! Pool error types.

use std::time::Duration;

use thiserror::Error;

/// Boxed backend error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while operating the pool.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The database could not be reached after exhausting startup retries.
    #[error("failed to connect after {attempts} attempts: {source}")]
    Connection {
        /// Number of connection attempts made.
        attempts: u32,
        /// Error from the last attempt.
        #[source]
        source: BoxError,
    },

    /// No connection became available within the acquire timeout.
    #[error("timed out waiting for a connection after {0:?}")]
    Timeout(Duration),

    /// The pool is draining or terminated.
    #[error("connection pool is closed")]
    PoolClosed,

    /// A liveness probe failed.
    #[error("health check failed: {0}")]
    HealthCheck(String),

    /// Outstanding handles were not released within the shutdown grace period.
    #[error("shutdown grace period of {grace:?} elapsed with {outstanding} connections in use")]
    ShutdownTimeout {
        /// Handles still checked out when the deadline passed.
        outstanding: u32,
        /// The grace period that elapsed.
        grace: Duration,
    },

    /// The backend failed to open or prepare a connection.
    #[error("backend error: {0}")]
    Backend(#[source] BoxError),
}

impl PoolError {
    /// Whether a caller may reasonably retry the failed operation.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Backend(_))
    }

    pub(crate) fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(err))
    }
}
