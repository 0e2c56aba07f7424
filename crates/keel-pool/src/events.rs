//! Pool event notifications.
//!
//! Events are published on a broadcast channel. Publishing never waits for
//! subscribers; a subscriber that falls behind observes `Lagged` instead of
//! stalling the pool.

use tokio::sync::broadcast;

use crate::health::HealthState;
use crate::shutdown::ShutdownSignal;

/// Capacity of the event channel.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Checked out `max_uses` times.
    MaxUses,
    /// Older than `max_lifetime`.
    MaxLifetime,
    /// Idle beyond `idle_timeout` while the pool was above its minimum size.
    IdleTimeout,
    /// Marked broken by its borrower or by a failed health check.
    Broken,
    /// Session reset failed.
    ResetFailed,
    /// Closed while the pool shut down.
    Shutdown,
    /// Taken back from its borrower when the shutdown grace period ran out.
    Revoked,
    /// Detached from the pool by its borrower.
    Detached,
}

/// Something that happened inside the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A new connection was opened.
    ConnectionCreated {
        /// Connection id.
        id: u64,
    },
    /// A connection was destroyed.
    ConnectionClosed {
        /// Connection id.
        id: u64,
        /// Why it was closed.
        reason: CloseReason,
    },
    /// The health flag changed.
    HealthChanged {
        /// Previous state.
        from: HealthState,
        /// New state.
        to: HealthState,
    },
    /// A probe was skipped because no connection was free.
    ProbeSkipped,
    /// Shutdown began.
    Draining {
        /// Signal that started the shutdown.
        signal: ShutdownSignal,
    },
    /// The grace period elapsed with handles still outstanding.
    ShutdownTimedOut {
        /// Handles still checked out.
        outstanding: u32,
    },
    /// Shutdown finished.
    Terminated,
}

#[derive(Debug)]
pub(crate) struct EventBus {
    sender: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub(crate) fn publish(&self, event: PoolEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }
}
