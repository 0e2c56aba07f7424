//! Scripted mock backend.
//!
//! [`MockLifecycle`] stands in for a database server. Tests script its
//! behavior (refused connects, slow connects, failing probes, failing
//! resets, failing statements) and inspect what the pool and the migration
//! runner did to it. Clones share the same server, so a test can keep one
//! handle after moving another into a pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_migrate::{MigrationRecord, MigrationTarget};
use keel_pool::ConnectionLifecycle;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;

use crate::ledger::MemoryLedger;

/// Errors produced by the mock backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MockError {
    /// A scripted connect failure.
    #[error("connection refused (attempt {attempt})")]
    ConnectionRefused {
        /// 1-based connect attempt number.
        attempt: usize,
    },
    /// The server is marked unhealthy.
    #[error("server is not responding")]
    Unhealthy,
    /// A scripted reset failure.
    #[error("session reset failed")]
    ResetFailed,
    /// A statement scripted to fail.
    #[error("statement failed: {0}")]
    Statement(String),
    /// Transaction misuse.
    #[error("transaction error: {0}")]
    Transaction(&'static str),
}

#[derive(Debug)]
struct ServerState {
    connect_failures: u32,
    connect_delay: Duration,
    connect_attempts: Vec<Instant>,
    opened: u64,
    closed: u64,
    healthy: bool,
    probe_delay: Duration,
    probes: u64,
    reset_failures: u32,
    resets: u64,
    ledger: MemoryLedger,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            connect_failures: 0,
            connect_delay: Duration::ZERO,
            connect_attempts: Vec::new(),
            opened: 0,
            closed: 0,
            healthy: true,
            probe_delay: Duration::ZERO,
            probes: 0,
            reset_failures: 0,
            resets: 0,
            ledger: MemoryLedger::default(),
        }
    }
}

/// A scripted, in-memory database server.
#[derive(Debug, Clone, Default)]
pub struct MockLifecycle {
    state: Arc<Mutex<ServerState>>,
}

impl MockLifecycle {
    /// A healthy server that accepts every connection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Scripting
    // =========================================================================

    /// Refuse the next `count` connection attempts.
    pub fn fail_connects(&self, count: u32) -> &Self {
        self.state.lock().connect_failures = count;
        self
    }

    /// Delay every connection attempt.
    pub fn connect_delay(&self, delay: Duration) -> &Self {
        self.state.lock().connect_delay = delay;
        self
    }

    /// Make health probes succeed or fail.
    pub fn set_healthy(&self, healthy: bool) -> &Self {
        self.state.lock().healthy = healthy;
        self
    }

    /// Delay every health probe.
    pub fn probe_delay(&self, delay: Duration) -> &Self {
        self.state.lock().probe_delay = delay;
        self
    }

    /// Fail the next `count` session resets.
    pub fn fail_resets(&self, count: u32) -> &Self {
        self.state.lock().reset_failures = count;
        self
    }

    /// Fail any statement containing `needle`.
    pub fn fail_statements_containing(&self, needle: impl Into<String>) -> &Self {
        self.state.lock().ledger.fail_statements_containing(needle);
        self
    }

    /// Write a ledger row directly, as if applied earlier.
    pub fn insert_ledger_row(&self, record: MigrationRecord) -> &Self {
        self.state.lock().ledger.insert(record);
        self
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// When each connection attempt started.
    #[must_use]
    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.state.lock().connect_attempts.clone()
    }

    /// Gaps between consecutive connection attempts.
    #[must_use]
    pub fn connect_gaps(&self) -> Vec<Duration> {
        self.connect_attempts()
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }

    /// Connections successfully opened.
    #[must_use]
    pub fn connections_opened(&self) -> u64 {
        self.state.lock().opened
    }

    /// Connections dropped by whoever held them last.
    #[must_use]
    pub fn connections_closed(&self) -> u64 {
        self.state.lock().closed
    }

    /// Connections opened and not yet dropped.
    #[must_use]
    pub fn connections_live(&self) -> u64 {
        let state = self.state.lock();
        state.opened - state.closed
    }

    /// Health probes run.
    #[must_use]
    pub fn probes(&self) -> u64 {
        self.state.lock().probes
    }

    /// Session resets attempted.
    #[must_use]
    pub fn resets(&self) -> u64 {
        self.state.lock().resets
    }

    /// Snapshot of the committed database state.
    #[must_use]
    pub fn ledger(&self) -> MemoryLedger {
        self.state.lock().ledger.clone()
    }
}

#[async_trait]
impl ConnectionLifecycle for MockLifecycle {
    type Connection = MockConnection;
    type Error = MockError;

    async fn connect(&self) -> Result<MockConnection, MockError> {
        let (delay, attempt) = {
            let mut state = self.state.lock();
            state.connect_attempts.push(Instant::now());
            (state.connect_delay, state.connect_attempts.len())
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(MockError::ConnectionRefused { attempt });
        }
        state.opened += 1;

        Ok(MockConnection {
            id: state.opened,
            state: Arc::clone(&self.state),
            tx: None,
        })
    }

    async fn health_check(&self, _conn: &mut MockConnection) -> Result<(), MockError> {
        let delay = {
            let mut state = self.state.lock();
            state.probes += 1;
            state.probe_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.state.lock().healthy {
            Ok(())
        } else {
            Err(MockError::Unhealthy)
        }
    }

    async fn reset(&self, conn: &mut MockConnection) -> Result<(), MockError> {
        conn.tx = None;
        let mut state = self.state.lock();
        state.resets += 1;
        if state.reset_failures > 0 {
            state.reset_failures -= 1;
            return Err(MockError::ResetFailed);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Transaction {
    statements: Vec<String>,
    records: Vec<MigrationRecord>,
}

/// A connection to a [`MockLifecycle`] server.
#[derive(Debug)]
pub struct MockConnection {
    id: u64,
    state: Arc<Mutex<ServerState>>,
    tx: Option<Transaction>,
}

impl MockConnection {
    /// Server-assigned connection number, starting at 1.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether a transaction is open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    fn tx_mut(&mut self) -> Result<&mut Transaction, MockError> {
        self.tx
            .as_mut()
            .ok_or(MockError::Transaction("no transaction in progress"))
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.state.lock().closed += 1;
    }
}

#[async_trait]
impl MigrationTarget for MockConnection {
    type Error = MockError;

    async fn ensure_ledger(&mut self, table: &str) -> Result<(), MockError> {
        self.state.lock().ledger.ensure_table(table);
        Ok(())
    }

    async fn applied(&mut self, _table: &str) -> Result<Vec<MigrationRecord>, MockError> {
        Ok(self.state.lock().ledger.rows())
    }

    async fn begin(&mut self) -> Result<(), MockError> {
        if self.tx.is_some() {
            return Err(MockError::Transaction("transaction already in progress"));
        }
        self.tx = Some(Transaction::default());
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<(), MockError> {
        let accepted = self.state.lock().ledger.attempt(sql);
        if !accepted {
            return Err(MockError::Statement(sql.to_string()));
        }
        self.tx_mut()?.statements.push(sql.to_string());
        Ok(())
    }

    async fn append(&mut self, _table: &str, record: &MigrationRecord) -> Result<(), MockError> {
        self.tx_mut()?.records.push(record.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), MockError> {
        let tx = self
            .tx
            .take()
            .ok_or(MockError::Transaction("no transaction in progress"))?;
        self.state.lock().ledger.commit(tx.statements, tx.records);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), MockError> {
        self.tx = None;
        Ok(())
    }
}
