//! # keel
//!
//! Database connectivity and resilience layer.
//!
//! `keel` wires the pieces together at the composition root: configuration
//! from the environment, a bounded [`Pool`](keel_pool::Pool) brought up
//! under a startup retry policy, a background health monitor, migrations at
//! boot and a graceful drain on shutdown.
//!
//! ## Boot sequence
//!
//! ```rust,ignore
//! use keel::{Database, DatabaseConfig};
//! use keel::migrate::MigrationSet;
//!
//! let config = DatabaseConfig::from_env()?;
//! let db = Database::connect_postgres(config).await?;
//! db.run_migrations(&MigrationSet::from_dir("migrations")?).await?;
//!
//! // Serve traffic with db.acquire(..) / db.release(..) and db.is_healthy().
//!
//! let signal = keel::signal::wait_for_signal().await;
//! let report = db.begin_shutdown(signal).await;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod database;
pub mod error;
pub mod signal;
pub mod telemetry;

pub use keel_migrate as migrate;
pub use keel_pool as pool;

pub use config::{DatabaseConfig, Environment};
pub use database::Database;
pub use error::{Error, Result};
pub use keel_pool::{
    ConnectionLifecycle, PoolError, PooledConnection, ShutdownOutcome, ShutdownReport,
    ShutdownSignal,
};
