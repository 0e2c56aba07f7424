//! Migration definitions.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::MigrationError;

/// A single schema change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    name: String,
    sql: String,
    checksum: String,
}

impl Migration {
    /// Create a migration. The checksum is computed from `sql`.
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        let sql = sql.into();
        Self {
            name: name.into(),
            checksum: checksum(&sql),
            sql,
        }
    }

    /// Unique, sequence-prefixed name such as `0001_create_listings`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The statements to run.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Lower-hex SHA-256 of the SQL.
    #[must_use]
    pub fn checksum(&self) -> &str {
        &self.checksum
    }
}

/// Lower-hex SHA-256 digest of `sql`.
#[must_use]
pub fn checksum(sql: &str) -> String {
    format!("{:x}", Sha256::digest(sql.as_bytes()))
}

/// An ordered set of migrations, keyed and sorted by name.
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    migrations: BTreeMap<String, Migration>,
}

impl MigrationSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a migration. Empty and duplicate names are rejected.
    pub fn add(&mut self, migration: Migration) -> Result<(), MigrationError> {
        if migration.name.trim().is_empty() {
            return Err(MigrationError::InvalidDefinition(
                "migration name cannot be empty".into(),
            ));
        }
        if self.migrations.contains_key(&migration.name) {
            return Err(MigrationError::InvalidDefinition(format!(
                "duplicate migration '{}'",
                migration.name
            )));
        }
        self.migrations.insert(migration.name.clone(), migration);
        Ok(())
    }

    /// Add a migration, builder style.
    pub fn with(mut self, migration: Migration) -> Result<Self, MigrationError> {
        self.add(migration)?;
        Ok(self)
    }

    /// Build a set from migrations in any order.
    pub fn from_migrations<I>(migrations: I) -> Result<Self, MigrationError>
    where
        I: IntoIterator<Item = Migration>,
    {
        let mut set = Self::new();
        for migration in migrations {
            set.add(migration)?;
        }
        Ok(set)
    }

    /// Load every `*.sql` file in `dir`. The file stem is the migration name.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, MigrationError> {
        let dir = dir.as_ref();
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| MigrationError::Io { path, source }
        };

        let mut set = Self::new();
        for entry in fs::read_dir(dir).map_err(io_err(dir))? {
            let path = entry.map_err(io_err(dir))?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                return Err(MigrationError::InvalidDefinition(format!(
                    "migration file name is not valid UTF-8: {}",
                    path.display()
                )));
            };
            let sql = fs::read_to_string(&path).map_err(io_err(&path))?;
            set.add(Migration::new(name, sql))?;
        }

        tracing::debug!(dir = %dir.display(), count = set.len(), "loaded migrations");
        Ok(set)
    }

    /// Look up a migration by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Migration> {
        self.migrations.get(name)
    }

    /// Migrations in application order.
    pub fn iter(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.values()
    }

    /// Number of migrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}
