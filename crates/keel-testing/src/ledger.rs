//! In-memory migration ledger.

use std::collections::BTreeMap;

use keel_migrate::MigrationRecord;

/// Committed schema state of a mock database: the ledger rows plus every
/// statement that took effect.
///
/// Statements are buffered per transaction on the connection and only land
/// here on commit, so a rolled-back migration leaves no trace except in
/// [`attempted`](Self::attempted).
#[derive(Debug, Default, Clone)]
pub struct MemoryLedger {
    rows: BTreeMap<String, MigrationRecord>,
    committed: Vec<String>,
    attempted: Vec<String>,
    failing: Vec<String>,
    tables: Vec<String>,
}

impl MemoryLedger {
    /// Ledger rows ordered by name.
    #[must_use]
    pub fn rows(&self) -> Vec<MigrationRecord> {
        self.rows.values().cloned().collect()
    }

    /// Names of recorded migrations, ordered.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.rows.keys().cloned().collect()
    }

    /// Statements from committed transactions, in commit order.
    #[must_use]
    pub fn committed(&self) -> &[String] {
        &self.committed
    }

    /// Every statement submitted, including rolled-back ones.
    #[must_use]
    pub fn attempted(&self) -> &[String] {
        &self.attempted
    }

    /// Ledger tables created so far.
    #[must_use]
    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    pub(crate) fn insert(&mut self, record: MigrationRecord) {
        self.rows.insert(record.name.clone(), record);
    }

    pub(crate) fn fail_statements_containing(&mut self, needle: impl Into<String>) {
        self.failing.push(needle.into());
    }

    pub(crate) fn ensure_table(&mut self, table: &str) {
        if !self.tables.iter().any(|t| t == table) {
            self.tables.push(table.to_string());
        }
    }

    /// Record an attempted statement; `false` if it is scripted to fail.
    pub(crate) fn attempt(&mut self, sql: &str) -> bool {
        self.attempted.push(sql.to_string());
        !self.failing.iter().any(|needle| sql.contains(needle.as_str()))
    }

    pub(crate) fn commit(&mut self, statements: Vec<String>, records: Vec<MigrationRecord>) {
        self.committed.extend(statements);
        for record in records {
            self.insert(record);
        }
    }
}
