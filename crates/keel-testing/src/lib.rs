//! # keel-testing
//!
//! Test infrastructure for the keel workspace.
//!
//! - [`MockLifecycle`]: a scripted in-memory database server implementing
//!   [`keel_pool::ConnectionLifecycle`], whose connections implement
//!   [`keel_migrate::MigrationTarget`]
//! - [`MemoryLedger`]: the committed migration state of that server
//! - [`pool_with`]: build a pool over a mock with a no-delay retry policy
//!
//! Timing-sensitive tests run on tokio's paused clock
//! (`#[tokio::test(start_paused = true)]`); every delay in the pool and in
//! the mock uses the tokio timer, so virtual time drives them exactly.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod ledger;
pub mod mock;

pub use ledger::MemoryLedger;
pub use mock::{MockConnection, MockError, MockLifecycle};

use keel_pool::{Pool, PoolBuilder, PoolError, RetryPolicy};

/// A pool builder over `mock` that does not retry the first connection.
#[must_use]
pub fn builder(mock: &MockLifecycle) -> PoolBuilder<MockLifecycle> {
    Pool::builder(mock.clone()).retry_policy(RetryPolicy::no_retry())
}

/// Build a pool over `mock` with the given bounds.
pub async fn pool_with(
    mock: &MockLifecycle,
    min: u32,
    max: u32,
) -> Result<Pool<MockLifecycle>, PoolError> {
    builder(mock)
        .min_connections(min)
        .max_connections(max)
        .build()
        .await
}
