//! # keel-pool
//!
//! Bounded async connection pool with lifecycle management.
//!
//! The pool is backend-agnostic: a [`ConnectionLifecycle`] opens, probes and
//! resets connections, and the pool decides when each of those happens. A
//! `sqlx` PostgreSQL lifecycle ships behind the `postgres` feature.
//!
//! ## Features
//!
//! - FIFO admission bounded by `max_connections`, with per-call timeouts
//! - Recycling by use count, lifetime and idle time
//! - Session reset before a returned connection is handed out again
//! - Startup connection retry with exponential backoff
//! - Advisory health monitoring with a failure threshold
//! - Graceful drain with a grace period and forced close
//! - Event notifications and checkout metrics
//!
//! ## Example
//!
//! ```rust,ignore
//! use keel_pool::{HealthConfig, HealthMonitor, Pool, ShutdownSignal};
//! use std::time::Duration;
//!
//! let pool = Pool::builder(lifecycle)
//!     .min_connections(2)
//!     .max_connections(10)
//!     .build()
//!     .await?;
//!
//! HealthMonitor::new(pool.clone(), HealthConfig::default()).spawn();
//!
//! let conn = pool.acquire(Duration::from_secs(2)).await?;
//! // Use connection...
//! pool.release(conn);
//!
//! let report = pool.begin_shutdown(ShutdownSignal::Terminate).await;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod lifecycle;
pub mod pool;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod retry;
pub mod shutdown;

// Configuration
pub use config::{ConnectionConfig, PoolConfig};

// Error types
pub use error::{BoxError, PoolError};

// Pool types
pub use pool::{Pool, PoolBuilder, PoolMetrics, PoolStatus, PooledConnection};

// Lifecycle management
pub use lifecycle::{ConnectionLifecycle, ConnectionMetadata, HealthCheckResult};

// Events
pub use events::{CloseReason, PoolEvent};

// Health monitoring
pub use health::{HealthConfig, HealthMonitor, HealthState, ProbeOutcome};

// Startup retry
pub use retry::{RetryPolicy, connect_with_retry};

// Shutdown
pub use shutdown::{ShutdownOutcome, ShutdownPhase, ShutdownReport, ShutdownSignal};

#[cfg(feature = "postgres")]
pub use postgres::PgLifecycle;
