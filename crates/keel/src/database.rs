//! The database object handed to application services.

use std::sync::Arc;
use std::time::Duration;

use keel_migrate::{MigrationReport, MigrationRunner, MigrationSet, MigrationTarget};
use keel_pool::{
    ConnectionLifecycle, HealthConfig, HealthMonitor, Pool, PoolEvent, PoolStatus,
    PooledConnection, ProbeOutcome, ShutdownReport, ShutdownSignal,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::DatabaseConfig;
use crate::error::Result;

/// Connectivity, health, migrations and shutdown behind one handle.
///
/// Build one at the composition root and clone it into every consumer.
/// There is no global instance.
pub struct Database<L: ConnectionLifecycle> {
    pool: Pool<L>,
    health: HealthConfig,
    migrations: MigrationRunner,
    monitor: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<L: ConnectionLifecycle> Clone for Database<L> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            health: self.health.clone(),
            migrations: self.migrations.clone(),
            monitor: Arc::clone(&self.monitor),
        }
    }
}

impl<L: ConnectionLifecycle> Database<L> {
    /// Validate `config`, bring the pool up under the startup retry policy
    /// and start the health monitor.
    ///
    /// Configuration and connectivity errors are returned here and are
    /// fatal to startup.
    pub async fn connect(config: DatabaseConfig, lifecycle: L) -> Result<Self> {
        config.validate()?;

        tracing::info!(
            host = %config.connection.host,
            port = config.connection.port,
            database = %config.connection.database,
            ssl = config.connection.ssl,
            "connecting to database"
        );

        let pool = Pool::builder(lifecycle)
            .pool_config(config.pool)
            .retry_policy(config.retry)
            .build()
            .await?;

        let monitor = HealthMonitor::new(pool.clone(), config.health.clone()).spawn();

        Ok(Self {
            pool,
            health: config.health,
            migrations: MigrationRunner::new().table(config.migrations_table),
            monitor: Arc::new(Mutex::new(Some(monitor))),
        })
    }

    /// Borrow a connection, waiting at most `timeout`.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection<L>> {
        Ok(self.pool.acquire(timeout).await?)
    }

    /// Borrow a connection using the configured acquire timeout.
    pub async fn get(&self) -> Result<PooledConnection<L>> {
        Ok(self.pool.get().await?)
    }

    /// Return a connection. Never blocks.
    pub fn release(&self, conn: PooledConnection<L>) {
        self.pool.release(conn);
    }

    /// Readiness flag. Advisory: a degraded database still serves
    /// `acquire`.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.pool.is_healthy()
    }

    /// Run a single health probe now.
    pub async fn probe(&self) -> ProbeOutcome {
        HealthMonitor::new(self.pool.clone(), self.health.clone())
            .probe_once()
            .await
    }

    /// Apply pending migrations. Call once at boot, before serving traffic.
    pub async fn run_migrations(&self, set: &MigrationSet) -> Result<MigrationReport>
    where
        L::Connection: MigrationTarget,
    {
        Ok(self.migrations.run(&self.pool, set).await?)
    }

    /// Drain and terminate. Resolves once the pool is terminated; repeated
    /// calls return the first report.
    pub async fn begin_shutdown(&self, signal: ShutdownSignal) -> ShutdownReport {
        let report = self.pool.begin_shutdown(signal).await;

        let monitor = self.monitor.lock().take();
        if let Some(handle) = monitor {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "health monitor task ended abnormally");
            }
        }

        report
    }

    /// Current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Subscribe to pool events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.pool.subscribe()
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &Pool<L> {
        &self.pool
    }
}

#[cfg(feature = "postgres")]
impl Database<keel_pool::PgLifecycle> {
    /// Connect to PostgreSQL with `config`.
    pub async fn connect_postgres(config: DatabaseConfig) -> Result<Self> {
        let lifecycle = keel_pool::PgLifecycle::new(config.connection.clone());
        Self::connect(config, lifecycle).await
    }
}

impl<L: ConnectionLifecycle> std::fmt::Debug for Database<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("pool", &self.pool)
            .field("migrations_table", &self.migrations.ledger_table())
            .finish_non_exhaustive()
    }
}
