//! Environment-driven configuration.
//!
//! | Variable | Default | Effect |
//! |---|---|---|
//! | `DB_HOST`, `DB_PORT`, `DB_NAME`, `DB_USER`, `DB_PASSWORD` | required | connection target and credentials |
//! | `DB_SSL` | `false` | require TLS; forced on when `APP_ENV` is `production` or `staging` |
//! | `DB_POOL_MIN` / `DB_POOL_MAX` | `1` / `10` | pool capacity bounds |
//! | `DB_ACQUIRE_TIMEOUT_MS` | `30000` | default acquire wait |
//! | `DB_IDLE_TIMEOUT_MS` | `300000` | idle eviction above the minimum size |
//! | `DB_MAX_USES` | `7500` | checkouts before a connection is recycled |
//! | `DB_STATEMENT_TIMEOUT_MS` | `30000` | per-statement cutoff on every connection |
//! | `DB_MAX_LIFETIME_MS` | `1800000` | age before a connection is recycled |
//! | `DB_HEALTH_INTERVAL_MS` | `30000` | probe interval |
//! | `DB_HEALTH_FAILURE_THRESHOLD` | `3` | consecutive failures before degraded |
//! | `DB_SHUTDOWN_GRACE_MS` | `30000` | drain deadline |
//! | `DB_CONNECT_RETRIES` | `5` | startup retries after the first attempt |
//! | `DB_MIGRATIONS_TABLE` | `keel_migrations` | ledger table |

use std::str::FromStr;
use std::time::Duration;

use keel_migrate::DEFAULT_LEDGER_TABLE;
use keel_pool::{ConnectionConfig, HealthConfig, PoolConfig, PoolError, RetryPolicy};

use crate::error::{Error, Result};

const REQUIRED: [&str; 5] = ["DB_HOST", "DB_PORT", "DB_NAME", "DB_USER", "DB_PASSWORD"];

/// Deployment environment, from `APP_ENV`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    /// `development`, or `APP_ENV` unset.
    Development,
    /// `test`.
    Test,
    /// `staging`.
    Staging,
    /// `production`.
    Production,
    /// Anything else.
    Other(String),
}

impl Environment {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "dev" | "development" => Self::Development,
            "test" => Self::Test,
            "staging" => Self::Staging,
            "prod" | "production" => Self::Production,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether TLS is mandatory.
    #[must_use]
    pub fn requires_tls(&self) -> bool {
        matches!(self, Self::Staging | Self::Production)
    }
}

/// Everything needed to bring the database layer up.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Connection target and per-connection settings.
    pub connection: ConnectionConfig,
    /// Pool sizing and recycling.
    pub pool: PoolConfig,
    /// Health monitor settings.
    pub health: HealthConfig,
    /// Startup retry policy.
    pub retry: RetryPolicy,
    /// Ledger table for migrations.
    pub migrations_table: String,
    /// Deployment environment.
    pub environment: Environment,
}

impl DatabaseConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let missing: Vec<&str> = REQUIRED
            .iter()
            .copied()
            .filter(|key| get(*key).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "missing required environment variables: {}",
                missing.join(", ")
            )));
        }

        let environment = get("APP_ENV")
            .map(|v| Environment::parse(&v))
            .unwrap_or(Environment::Development);

        let mut ssl = parse::<Flag>(&get, "DB_SSL")?.map(|f| f.0);
        if environment.requires_tls() {
            if ssl == Some(false) {
                tracing::warn!(
                    environment = ?environment,
                    "DB_SSL=false ignored, TLS is required in this environment"
                );
            }
            ssl = Some(true);
        }

        let mut connection = ConnectionConfig::new()
            .host(get("DB_HOST").unwrap_or_default())
            .database(get("DB_NAME").unwrap_or_default())
            .credentials(
                get("DB_USER").unwrap_or_default(),
                get("DB_PASSWORD").unwrap_or_default(),
            )
            .ssl(ssl.unwrap_or(false));
        if let Some(port) = parse::<u16>(&get, "DB_PORT")? {
            connection = connection.port(port);
        }
        if let Some(timeout) = millis(&get, "DB_STATEMENT_TIMEOUT_MS")? {
            connection = connection.statement_timeout(timeout);
        }

        let mut pool = PoolConfig::new();
        if let Some(min) = parse(&get, "DB_POOL_MIN")? {
            pool = pool.min_connections(min);
        }
        if let Some(max) = parse(&get, "DB_POOL_MAX")? {
            pool = pool.max_connections(max);
        }
        if let Some(timeout) = millis(&get, "DB_ACQUIRE_TIMEOUT_MS")? {
            pool = pool.acquire_timeout(timeout);
        }
        if let Some(timeout) = millis(&get, "DB_IDLE_TIMEOUT_MS")? {
            pool = pool.idle_timeout(timeout);
        }
        if let Some(uses) = parse(&get, "DB_MAX_USES")? {
            pool = pool.max_uses(uses);
        }
        if let Some(lifetime) = millis(&get, "DB_MAX_LIFETIME_MS")? {
            pool = pool.max_lifetime(lifetime);
        }
        if let Some(grace) = millis(&get, "DB_SHUTDOWN_GRACE_MS")? {
            pool = pool.shutdown_grace(grace);
        }

        let mut health = HealthConfig::new();
        if let Some(interval) = millis(&get, "DB_HEALTH_INTERVAL_MS")? {
            health = health.interval(interval);
        }
        if let Some(threshold) = parse(&get, "DB_HEALTH_FAILURE_THRESHOLD")? {
            health = health.failure_threshold(threshold);
        }

        let mut retry = RetryPolicy::new();
        if let Some(retries) = parse(&get, "DB_CONNECT_RETRIES")? {
            retry = retry.max_retries(retries);
        }

        let config = Self {
            connection,
            pool,
            health,
            retry,
            migrations_table: get("DB_MIGRATIONS_TABLE")
                .unwrap_or_else(|| DEFAULT_LEDGER_TABLE.to_string()),
            environment,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.connection.validate().map_err(config_error)?;
        self.pool.validate().map_err(config_error)?;
        self.health.validate().map_err(config_error)?;
        Ok(())
    }
}

fn config_error(err: PoolError) -> Error {
    match err {
        PoolError::Config(msg) => Error::Config(msg),
        other => Error::Pool(other),
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
{
    get(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|_| {
                Error::Config(format!("{key} has an invalid value '{}'", raw.trim()))
            })
        })
        .transpose()
}

fn millis(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    Ok(parse::<u64>(get, key)?.map(Duration::from_millis))
}

/// Boolean environment value: `true/false`, `1/0`, `yes/no`, `on/off`.
struct Flag(bool);

impl FromStr for Flag {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Self(true)),
            "false" | "0" | "no" | "off" => Ok(Self(false)),
            _ => Err(()),
        }
    }
}
