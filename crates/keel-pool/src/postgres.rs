//! PostgreSQL connection lifecycle backed by `sqlx`.

use std::fmt;
use std::io;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{Connection, Executor};

use crate::config::ConnectionConfig;
use crate::lifecycle::ConnectionLifecycle;

/// Opens, probes and resets `sqlx` PostgreSQL connections.
///
/// The statement timeout is applied as a session default through the
/// startup options, so `RESET ALL` between checkouts keeps it in place.
#[derive(Clone)]
pub struct PgLifecycle {
    config: ConnectionConfig,
    options: PgConnectOptions,
}

impl PgLifecycle {
    /// Create a lifecycle for the given connection settings.
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        let ssl_mode = if config.ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        };

        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password)
            .ssl_mode(ssl_mode)
            .application_name(&config.application_name)
            .options([(
                "statement_timeout",
                config.statement_timeout.as_millis().to_string(),
            )]);

        Self { config, options }
    }

    /// The settings this lifecycle connects with.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

impl fmt::Debug for PgLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `PgConnectOptions` would print the password.
        f.debug_struct("PgLifecycle")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ConnectionLifecycle for PgLifecycle {
    type Connection = PgConnection;
    type Error = sqlx::Error;

    async fn connect(&self) -> Result<PgConnection, sqlx::Error> {
        tracing::debug!(
            host = %self.config.host,
            port = self.config.port,
            database = %self.config.database,
            ssl = self.config.ssl,
            "opening postgres connection"
        );

        let connect = PgConnection::connect_with(&self.options);
        match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(sqlx::Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!(
                    "connect to {}:{} timed out after {:?}",
                    self.config.host, self.config.port, self.config.connect_timeout
                ),
            ))),
        }
    }

    async fn health_check(&self, conn: &mut PgConnection) -> Result<(), sqlx::Error> {
        let _: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&mut *conn).await?;
        Ok(())
    }

    async fn reset(&self, conn: &mut PgConnection) -> Result<(), sqlx::Error> {
        Executor::execute(&mut *conn, "RESET ALL").await?;
        Ok(())
    }
}
