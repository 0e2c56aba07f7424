//! Connection lifecycle management.
//!
//! The pool never talks to a database directly. A [`ConnectionLifecycle`]
//! implementation opens connections, probes them and cleans up session
//! state between checkouts; the pool decides when each of those happens.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

/// Backend hooks used by the pool to manage connections.
#[async_trait]
pub trait ConnectionLifecycle: Send + Sync + 'static {
    /// The live connection type handed to callers.
    type Connection: Send + 'static;

    /// Error produced by the backend.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open a new connection.
    async fn connect(&self) -> Result<Self::Connection, Self::Error>;

    /// Run a trivial round trip on the connection.
    async fn health_check(&self, conn: &mut Self::Connection) -> Result<(), Self::Error>;

    /// Clear session state left behind by the previous borrower.
    async fn reset(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        let _ = conn;
        Ok(())
    }
}

/// Bookkeeping attached to every live connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// Pool-unique connection id.
    pub id: u64,
    /// When the connection was opened.
    pub created_at: Instant,
    /// When the connection was last checked out.
    pub last_checkout: Option<Instant>,
    /// Number of times the connection has been checked out.
    pub use_count: u64,
    /// Session state must be reset before the next checkout.
    pub needs_reset: bool,
}

impl ConnectionMetadata {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            last_checkout: None,
            use_count: 0,
            needs_reset: false,
        }
    }

    /// Time since the connection was opened.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether the connection has outlived `max_lifetime`.
    #[must_use]
    pub fn is_expired(&self, max_lifetime: Duration) -> bool {
        self.age() >= max_lifetime
    }

    /// Whether the connection has been used `max_uses` times or more.
    #[must_use]
    pub fn is_worn_out(&self, max_uses: u64) -> bool {
        self.use_count >= max_uses
    }
}

/// Outcome of a single liveness probe.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    /// Whether the probe succeeded.
    pub healthy: bool,
    /// Round-trip time of the probe.
    pub latency: Duration,
    /// Failure description, if any.
    pub error: Option<String>,
}

impl HealthCheckResult {
    pub(crate) fn success(latency: Duration) -> Self {
        Self {
            healthy: true,
            latency,
            error: None,
        }
    }

    pub(crate) fn failure(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency,
            error: Some(error.into()),
        }
    }
}
