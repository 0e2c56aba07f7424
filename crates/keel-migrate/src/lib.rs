//! # keel-migrate
//!
//! Ordered, transactional schema migrations applied through a
//! [`keel_pool::Pool`].
//!
//! Each migration runs in its own transaction on a pooled connection and is
//! recorded in a ledger table when it commits. Re-running the same set is a
//! no-op; a migration whose SQL changed after it was applied is reported as
//! drift instead of being silently skipped.
//!
//! ## Example
//!
//! ```rust,ignore
//! use keel_migrate::{MigrationRunner, MigrationSet};
//!
//! let set = MigrationSet::from_dir("migrations")?;
//! let report = MigrationRunner::new().run(&pool, &set).await?;
//! println!("applied {} migrations", report.applied.len());
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod ledger;
pub mod migration;
#[cfg(feature = "postgres")]
mod postgres;
pub mod runner;

pub use error::MigrationError;
pub use ledger::{MigrationRecord, MigrationStatus, MigrationTarget};
pub use migration::{Migration, MigrationSet, checksum};
pub use runner::{DEFAULT_LEDGER_TABLE, MigrationReport, MigrationRunner};
