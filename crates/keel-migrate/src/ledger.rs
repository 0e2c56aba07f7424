//! The applied-migrations ledger and the backend seam for applying
//! migrations.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Recorded outcome of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationStatus {
    /// Committed successfully.
    Applied,
    /// Marked as failed outside the runner; treated as not applied.
    Failed,
}

impl MigrationStatus {
    /// The value stored in the ledger's `status` column.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "applied" => Ok(Self::Applied),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown migration status '{other}'")),
        }
    }
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    /// Migration name.
    pub name: String,
    /// Checksum of the SQL that was applied.
    pub checksum: String,
    /// When the migration committed.
    pub applied_at: DateTime<Utc>,
    /// Recorded outcome.
    pub status: MigrationStatus,
}

impl MigrationRecord {
    /// A record for a migration that just committed.
    #[must_use]
    pub fn applied(name: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            checksum: checksum.into(),
            applied_at: Utc::now(),
            status: MigrationStatus::Applied,
        }
    }

    /// Whether the row counts as applied.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        self.status == MigrationStatus::Applied
    }
}

/// A connection that can hold the ledger and run migrations in
/// transactions.
///
/// `table` is always a validated identifier and may be interpolated into
/// SQL directly.
#[async_trait]
pub trait MigrationTarget: Send {
    /// Error produced by the backend.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Create the ledger table if it does not exist.
    async fn ensure_ledger(&mut self, table: &str) -> Result<(), Self::Error>;

    /// Every ledger row, in any order.
    async fn applied(&mut self, table: &str) -> Result<Vec<MigrationRecord>, Self::Error>;

    /// Start a transaction.
    async fn begin(&mut self) -> Result<(), Self::Error>;

    /// Run a migration's statements inside the open transaction.
    async fn execute(&mut self, sql: &str) -> Result<(), Self::Error>;

    /// Write a ledger row inside the open transaction, replacing any row
    /// with the same name.
    async fn append(&mut self, table: &str, record: &MigrationRecord) -> Result<(), Self::Error>;

    /// Commit the open transaction.
    async fn commit(&mut self) -> Result<(), Self::Error>;

    /// Roll back the open transaction.
    async fn rollback(&mut self) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_column_value() {
        for status in [MigrationStatus::Applied, MigrationStatus::Failed] {
            assert_eq!(status.as_str().parse::<MigrationStatus>(), Ok(status));
        }
        assert!("pending".parse::<MigrationStatus>().is_err());
    }

    #[test]
    fn test_new_record_is_applied() {
        let record = MigrationRecord::applied("0001_init", "abc");
        assert!(record.is_applied());
        assert_eq!(record.status.to_string(), "applied");
    }
}
