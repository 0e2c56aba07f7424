//! Sequential migration runner.

use std::collections::HashMap;
use std::time::Instant;

use keel_pool::{ConnectionLifecycle, Pool};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::MigrationError;
use crate::ledger::{MigrationRecord, MigrationTarget};
use crate::migration::{Migration, MigrationSet};

/// Default ledger table name.
pub const DEFAULT_LEDGER_TABLE: &str = "keel_migrations";

/// What a run did.
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    /// Migrations applied by this run, in order.
    pub applied: Vec<MigrationRecord>,
    /// Migrations already in the ledger.
    pub skipped: Vec<String>,
}

impl MigrationReport {
    /// Whether the run changed the schema.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Applies a [`MigrationSet`] against a pool, one transaction per migration.
///
/// Migrations run strictly in name order and never concurrently. A failure
/// rolls back that migration only, stops the run and is returned as
/// [`MigrationError::Failed`]; migrations committed before it stay applied.
#[derive(Debug, Clone)]
pub struct MigrationRunner {
    table: String,
}

impl Default for MigrationRunner {
    fn default() -> Self {
        Self {
            table: DEFAULT_LEDGER_TABLE.to_string(),
        }
    }
}

impl MigrationRunner {
    /// Create a runner using the default ledger table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different ledger table.
    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// The ledger table name.
    #[must_use]
    pub fn ledger_table(&self) -> &str {
        &self.table
    }

    /// Apply every migration in `set` that the ledger does not record.
    pub async fn run<L>(
        &self,
        pool: &Pool<L>,
        set: &MigrationSet,
    ) -> Result<MigrationReport, MigrationError>
    where
        L: ConnectionLifecycle,
        L::Connection: MigrationTarget,
    {
        validate_identifier(&self.table)?;

        let recorded = self.load_ledger(pool).await?;
        check_drift(set, &recorded)?;

        let mut report = MigrationReport::default();
        for migration in set.iter() {
            if recorded
                .get(migration.name())
                .is_some_and(MigrationRecord::is_applied)
            {
                tracing::debug!(migration = migration.name(), "already applied");
                report.skipped.push(migration.name().to_string());
                continue;
            }

            let record = self.apply(pool, migration).await?;
            report.applied.push(record);
        }

        tracing::info!(
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            "migrations complete"
        );
        Ok(report)
    }

    async fn load_ledger<L>(
        &self,
        pool: &Pool<L>,
    ) -> Result<HashMap<String, MigrationRecord>, MigrationError>
    where
        L: ConnectionLifecycle,
        L::Connection: MigrationTarget,
    {
        let conn = pool.get().await?;
        let rows = {
            let mut target = conn.connection().await?;
            target
                .ensure_ledger(&self.table)
                .await
                .map_err(MigrationError::ledger)?;
            target
                .applied(&self.table)
                .await
                .map_err(MigrationError::ledger)?
        };
        pool.release(conn);

        Ok(rows
            .into_iter()
            .map(|record| (record.name.clone(), record))
            .collect())
    }

    async fn apply<L>(
        &self,
        pool: &Pool<L>,
        migration: &Migration,
    ) -> Result<MigrationRecord, MigrationError>
    where
        L: ConnectionLifecycle,
        L::Connection: MigrationTarget,
    {
        let name = migration.name();
        let started = Instant::now();
        tracing::info!(migration = name, "applying migration");

        let mut conn = pool.get().await?;
        let record = MigrationRecord::applied(name, migration.checksum());

        let (outcome, reusable) = {
            let mut target = conn.connection().await?;
            target
                .begin()
                .await
                .map_err(|e| MigrationError::failed(name, e))?;

            let outcome = match target.execute(migration.sql()).await {
                Ok(()) => match target.append(&self.table, &record).await {
                    Ok(()) => target.commit().await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };

            let reusable = match &outcome {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(migration = name, error = %e, "migration failed, rolling back");
                    roll_back(&mut *target, name).await
                }
            };
            (outcome, reusable)
        };

        if !reusable {
            conn.mark_broken();
        }
        pool.release(conn);

        match outcome {
            Ok(()) => {
                tracing::info!(
                    migration = name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "migration applied"
                );
                Ok(record)
            }
            Err(e) => Err(MigrationError::failed(name, e)),
        }
    }
}

/// Roll back the open transaction. Returns `false` if the connection is
/// left in an unknown state.
async fn roll_back<T: MigrationTarget>(target: &mut T, name: &str) -> bool {
    match target.rollback().await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(migration = name, error = %e, "rollback failed, discarding connection");
            false
        }
    }
}

fn check_drift(
    set: &MigrationSet,
    recorded: &HashMap<String, MigrationRecord>,
) -> Result<(), MigrationError> {
    for record in recorded.values().filter(|r| r.is_applied()) {
        match set.get(&record.name) {
            Some(migration) if migration.checksum() != record.checksum => {
                return Err(MigrationError::ChecksumMismatch {
                    name: record.name.clone(),
                    recorded: record.checksum.clone(),
                    current: migration.checksum().to_string(),
                });
            }
            Some(_) => {}
            None => {
                tracing::warn!(
                    migration = %record.name,
                    "ledger records a migration with no matching definition"
                );
            }
        }
    }
    Ok(())
}

/// Validate a ledger table name so it can be interpolated into SQL.
fn validate_identifier(name: &str) -> Result<(), MigrationError> {
    #[allow(clippy::expect_used)]
    static IDENTIFIER_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]{0,62}$").expect("identifier pattern is valid")
    });

    if name.is_empty() {
        return Err(MigrationError::InvalidDefinition(
            "ledger table name cannot be empty".into(),
        ));
    }

    if !IDENTIFIER_RE.is_match(name) {
        return Err(MigrationError::InvalidDefinition(format!(
            "invalid ledger table name '{name}': must start with letter/underscore, \
             contain only alphanumerics/_, and be 1-63 characters"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier_valid() {
        assert!(validate_identifier("keel_migrations").is_ok());
        assert!(validate_identifier("_schema_history").is_ok());
        assert!(validate_identifier("Ledger2").is_ok());
    }

    #[test]
    fn test_validate_identifier_invalid() {
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1ledger").is_err());
        assert!(validate_identifier("ledger-table").is_err());
        assert!(validate_identifier("ledger; DROP TABLE users").is_err());
        assert!(validate_identifier(&"x".repeat(64)).is_err());
    }

    #[test]
    fn test_drift_detected_for_applied_rows_only() {
        let set = MigrationSet::from_migrations([Migration::new("0001_a", "SELECT 1")])
            .unwrap_or_default();

        let mut recorded = HashMap::new();
        recorded.insert(
            "0001_a".to_string(),
            MigrationRecord::applied("0001_a", "stale"),
        );
        assert!(matches!(
            check_drift(&set, &recorded),
            Err(MigrationError::ChecksumMismatch { .. })
        ));

        if let Some(row) = recorded.get_mut("0001_a") {
            row.status = crate::ledger::MigrationStatus::Failed;
        }
        assert!(check_drift(&set, &recorded).is_ok());
    }

    #[test]
    fn test_unknown_ledger_rows_are_ignored() {
        let mut recorded = HashMap::new();
        recorded.insert(
            "0000_gone".to_string(),
            MigrationRecord::applied("0000_gone", "abc"),
        );
        assert!(check_drift(&MigrationSet::new(), &recorded).is_ok());
    }
}
