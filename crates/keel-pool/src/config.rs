//! Pool and connection configuration.

use std::fmt;
use std::time::Duration;

use crate::error::PoolError;

/// Connection target and session settings passed to the backend.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Server hostname or IP address.
    pub host: String,

    /// Server port (default: 5432).
    pub port: u16,

    /// Database name.
    pub database: String,

    /// User name.
    pub user: String,

    /// Password. Never logged.
    pub password: String,

    /// Whether to require an encrypted transport.
    pub ssl: bool,

    /// Per-statement cutoff applied to every session.
    pub statement_timeout: Duration,

    /// Time allowed for establishing a single connection.
    pub connect_timeout: Duration,

    /// Application name reported to the server.
    pub application_name: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: String::new(),
            user: String::new(),
            password: String::new(),
            ssl: false,
            statement_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            application_name: "keel".to_string(),
        }
    }
}

impl ConnectionConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the server host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the server port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the database name.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set user name and password.
    #[must_use]
    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    /// Require TLS.
    #[must_use]
    pub fn ssl(mut self, enabled: bool) -> Self {
        self.ssl = enabled;
        self
    }

    /// Set the statement timeout.
    #[must_use]
    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Validate the connection target.
    pub fn validate(&self) -> Result<(), PoolError> {
        let mut missing = Vec::new();
        if self.host.trim().is_empty() {
            missing.push("host");
        }
        if self.database.trim().is_empty() {
            missing.push("database");
        }
        if self.user.trim().is_empty() {
            missing.push("user");
        }
        if self.password.is_empty() {
            missing.push("password");
        }
        if !missing.is_empty() {
            return Err(PoolError::Config(format!(
                "missing connection settings: {}",
                missing.join(", ")
            )));
        }
        if self.port == 0 {
            return Err(PoolError::Config("port must be non-zero".into()));
        }
        if self.statement_timeout.is_zero() {
            return Err(PoolError::Config(
                "statement_timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"***")
            .field("ssl", &self.ssl)
            .field("statement_timeout", &self.statement_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("application_name", &self.application_name)
            .finish()
    }
}

/// Configuration for the connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum number of live connections kept by the pool.
    pub min_connections: u32,

    /// Maximum number of live connections.
    pub max_connections: u32,

    /// Default time to wait in [`Pool::get`](crate::Pool::get).
    pub acquire_timeout: Duration,

    /// Idle time after which connections beyond `min_connections` are closed.
    pub idle_timeout: Duration,

    /// Maximum age of a connection before it is recycled.
    pub max_lifetime: Duration,

    /// Number of checkouts after which a connection is recycled.
    pub max_uses: u64,

    /// Reset session state before a returned connection is handed out again.
    pub reset_on_return: bool,

    /// How often the reaper looks for idle and expired connections.
    pub reaper_interval: Duration,

    /// How long a shutdown waits for outstanding handles.
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(1800),
            max_uses: 7500,
            reset_on_return: true,
            reaper_interval: Duration::from_secs(10),
            shutdown_grace: Duration::from_millis(30_000),
        }
    }
}

impl PoolConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the default acquire timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the idle timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the maximum connection lifetime.
    #[must_use]
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Set the per-connection use limit.
    #[must_use]
    pub fn max_uses(mut self, uses: u64) -> Self {
        self.max_uses = uses;
        self
    }

    /// Enable or disable session reset between checkouts.
    #[must_use]
    pub fn reset_on_return(mut self, enabled: bool) -> Self {
        self.reset_on_return = enabled;
        self
    }

    /// Set the reaper interval.
    #[must_use]
    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Set the shutdown grace period.
    #[must_use]
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections == 0 {
            return Err(PoolError::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PoolError::Config(format!(
                "min_connections ({}) cannot exceed max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.acquire_timeout.is_zero() {
            return Err(PoolError::Config(
                "acquire_timeout must be greater than zero".into(),
            ));
        }
        if self.idle_timeout.is_zero() || self.max_lifetime.is_zero() {
            return Err(PoolError::Config(
                "idle_timeout and max_lifetime must be greater than zero".into(),
            ));
        }
        if self.max_uses == 0 {
            return Err(PoolError::Config("max_uses must be greater than 0".into()));
        }
        if self.reaper_interval.is_zero() {
            return Err(PoolError::Config(
                "reaper_interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(PoolConfig::default().validate().is_ok());
    }

    #[test]
    fn test_min_exceeds_max() {
        let config = PoolConfig::new().min_connections(20).max_connections(10);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));
    }

    #[test]
    fn test_zero_values_rejected() {
        assert!(PoolConfig::new().max_connections(0).validate().is_err());
        assert!(PoolConfig::new().max_uses(0).validate().is_err());
        assert!(
            PoolConfig::new()
                .acquire_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_connection_config_missing_fields() {
        let err = ConnectionConfig::new().host("").validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("host"));
        assert!(msg.contains("database"));
        assert!(msg.contains("user"));
        assert!(msg.contains("password"));
    }

    #[test]
    fn test_connection_config_requires_password() {
        let config = ConnectionConfig::new()
            .database("listings")
            .credentials("app", "");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("password"));

        let config = config.credentials("app", "hunter2");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_connection_config_debug_redacts_password() {
        let config = ConnectionConfig::new()
            .database("listings")
            .credentials("app", "hunter2");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("***"));
    }
}
