//! Graceful shutdown.
//!
//! Shutdown moves the pool through `Running -> Draining -> Terminated`.
//! Draining rejects new checkouts, closes idle connections and stops the
//! background tasks, then waits for the outstanding-handle count to reach
//! zero. If the grace period runs out first, every outstanding lease is
//! revoked, the pool takes those connections back and closes them, and the
//! pool terminates anyway.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::PoolError;
use crate::events::PoolEvent;
use crate::lifecycle::ConnectionLifecycle;
use crate::pool::{Pool, PoolInner};

/// Pool shutdown phase. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShutdownPhase {
    /// Serving checkouts.
    Running,
    /// Refusing checkouts, waiting for outstanding handles.
    Draining,
    /// All connections closed.
    Terminated,
}

/// What triggered the shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownSignal {
    /// SIGINT / Ctrl-C.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// Requested by the application.
    Manual,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => f.write_str("interrupt"),
            Self::Terminate => f.write_str("terminate"),
            Self::Manual => f.write_str("manual"),
        }
    }
}

/// How draining ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every handle was released within the grace period.
    Drained,
    /// The grace period elapsed and outstanding leases were revoked.
    ForceClosed {
        /// Handles still checked out at the deadline.
        outstanding: u32,
    },
}

/// Summary of a completed shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// Signal that started the shutdown.
    pub signal: ShutdownSignal,
    /// How draining ended.
    pub outcome: ShutdownOutcome,
    /// Grace period in effect.
    pub grace: Duration,
    /// Time from the start of draining to termination.
    pub elapsed: Duration,
}

impl ShutdownReport {
    /// Whether the grace period elapsed.
    #[must_use]
    pub fn timed_out(&self) -> bool {
        matches!(self.outcome, ShutdownOutcome::ForceClosed { .. })
    }

    /// The shutdown timeout error, if draining did not finish in time.
    #[must_use]
    pub fn timeout_error(&self) -> Option<PoolError> {
        match self.outcome {
            ShutdownOutcome::Drained => None,
            ShutdownOutcome::ForceClosed { outstanding } => Some(PoolError::ShutdownTimeout {
                outstanding,
                grace: self.grace,
            }),
        }
    }
}

impl<L: ConnectionLifecycle> Pool<L> {
    /// Shut the pool down and wait until it is terminated.
    ///
    /// The first call starts draining; the wait for outstanding handles runs
    /// on a task owned by the pool, so dropping this future does not stop
    /// the shutdown. Later or concurrent calls do not restart it; every
    /// caller waits for termination and gets the same report.
    pub async fn begin_shutdown(&self, signal: ShutdownSignal) -> ShutdownReport {
        let inner = &self.inner;
        let grace = inner.config.shutdown_grace;

        let first = inner.phase.send_if_modified(|phase| {
            if *phase == ShutdownPhase::Running {
                *phase = ShutdownPhase::Draining;
                true
            } else {
                false
            }
        });

        if first {
            tracing::info!(
                signal = %signal,
                grace_ms = grace.as_millis() as u64,
                "draining connection pool"
            );
            inner.events.publish(PoolEvent::Draining { signal });

            inner.semaphore.close();
            inner.background.cancel();
            inner.close_idle();

            tokio::spawn(Arc::clone(inner).drain(signal, Instant::now()));
        } else {
            tracing::debug!(signal = %signal, "shutdown already in progress");
        }

        let mut phase = inner.phase.subscribe();
        let _ = phase
            .wait_for(|phase| *phase == ShutdownPhase::Terminated)
            .await;
        let report = inner.shutdown_report.lock().clone();
        report.unwrap_or(ShutdownReport {
            signal,
            outcome: ShutdownOutcome::Drained,
            grace,
            elapsed: Duration::ZERO,
        })
    }

    /// Close the pool, waiting up to the grace period for handles.
    pub async fn close(&self) {
        let _ = self.begin_shutdown(ShutdownSignal::Manual).await;
        tracing::info!("connection pool closed");
    }
}

impl<L: ConnectionLifecycle> PoolInner<L> {
    /// Wait for outstanding handles, force-close the rest at the deadline
    /// and move to `Terminated`.
    async fn drain(self: Arc<Self>, signal: ShutdownSignal, started: Instant) {
        let grace = self.config.shutdown_grace;

        let mut outstanding = self.outstanding.subscribe();
        let drained = tokio::time::timeout(grace, outstanding.wait_for(|count| *count == 0))
            .await
            .is_ok();

        let outcome = if drained {
            ShutdownOutcome::Drained
        } else {
            let remaining = *self.outstanding.borrow();
            let err = PoolError::ShutdownTimeout {
                outstanding: remaining,
                grace,
            };
            tracing::error!(error = %err, "forcing connection pool closed");
            self.force_close_leases();
            self.events.publish(PoolEvent::ShutdownTimedOut {
                outstanding: remaining,
            });
            ShutdownOutcome::ForceClosed {
                outstanding: remaining,
            }
        };

        let report = ShutdownReport {
            signal,
            outcome,
            grace,
            elapsed: started.elapsed(),
        };
        *self.shutdown_report.lock() = Some(report.clone());

        self.phase.send_if_modified(|phase| {
            if *phase < ShutdownPhase::Terminated {
                *phase = ShutdownPhase::Terminated;
                true
            } else {
                false
            }
        });
        self.events.publish(PoolEvent::Terminated);

        tracing::info!(
            elapsed_ms = report.elapsed.as_millis() as u64,
            forced = report.timed_out(),
            "connection pool terminated"
        );
    }
}
