//! Connection pool implementation.
//!
//! Admission is bounded by a FIFO semaphore sized to `max_connections`, so a
//! waiter that arrived first is served first and a waiter that gives up is
//! removed from the queue before it can be granted a permit. All size and
//! availability accounting lives in a single [`PoolState`] behind one mutex;
//! no lock is held across an `.await`.
//!
//! A checked-out connection sits in a [`Slot`] shared between the handle and
//! the pool's lease table, so a forced close can take it back from a
//! borrower that never returns it.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{
    MappedMutexGuard, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, OwnedSemaphorePermit,
    Semaphore, TryAcquireError, broadcast, watch,
};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::events::{CloseReason, EventBus, PoolEvent};
use crate::health::HealthState;
use crate::lifecycle::{ConnectionLifecycle, ConnectionMetadata};
use crate::retry::{RetryPolicy, connect_with_retry};
use crate::shutdown::{ShutdownPhase, ShutdownReport};

/// A bounded pool of database connections.
///
/// The pool is an explicitly constructed object: build it once at the
/// composition root and hand clones to every consumer. Clones share the
/// same connections.
///
/// # Example
///
/// ```rust,ignore
/// use keel_pool::{Pool, PoolConfig};
/// use std::time::Duration;
///
/// let pool = Pool::builder(lifecycle)
///     .min_connections(2)
///     .max_connections(10)
///     .build()
///     .await?;
///
/// let conn = pool.acquire(Duration::from_secs(2)).await?;
/// run_query(&mut *conn.connection().await?).await?;
/// pool.release(conn);
/// ```
pub struct Pool<L: ConnectionLifecycle> {
    pub(crate) inner: Arc<PoolInner<L>>,
}

impl<L: ConnectionLifecycle> Clone for Pool<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct PoolInner<L: ConnectionLifecycle> {
    /// Pool configuration.
    pub(crate) config: PoolConfig,

    /// Backend hooks.
    pub(crate) lifecycle: L,

    /// Size, availability and health accounting.
    pub(crate) state: Mutex<PoolState<L::Connection>>,

    /// Admission control, one permit per connection that may be checked out.
    pub(crate) semaphore: Arc<Semaphore>,

    /// Shutdown phase; only ever moves forward.
    pub(crate) phase: watch::Sender<ShutdownPhase>,

    /// Number of handles currently checked out.
    pub(crate) outstanding: watch::Sender<u32>,

    /// Stops the reaper and health monitor.
    pub(crate) background: CancellationToken,

    /// Revokes outstanding handles on forced close.
    pub(crate) leases: CancellationToken,

    /// Event channel.
    pub(crate) events: EventBus,

    /// Result of the first completed shutdown.
    pub(crate) shutdown_report: Mutex<Option<ShutdownReport>>,

    /// Counter for generating connection IDs.
    next_connection_id: AtomicU64,

    /// When the pool was created.
    created_at: Instant,

    /// Pool metrics.
    pub(crate) metrics: Mutex<PoolMetricsInner>,
}

/// A checked-out connection. `None` once the pool has taken it back.
pub(crate) type Slot<C> = Arc<AsyncMutex<Option<C>>>;

/// Mutable pool bookkeeping.
pub(crate) struct PoolState<C> {
    /// Idle connections, most recently returned at the back.
    pub(crate) idle: VecDeque<IdleConnection<C>>,
    /// Checked-out connections by id.
    pub(crate) leased: HashMap<u64, Slot<C>>,
    /// Live connections plus connections being opened.
    pub(crate) total: u32,
    /// Connections checked out by callers.
    pub(crate) in_use: u32,
    /// Advisory health flag.
    pub(crate) health: HealthState,
    /// Probe failures since the last success.
    pub(crate) consecutive_failures: u32,
    /// When the last probe finished.
    pub(crate) last_check: Option<Instant>,
}

pub(crate) struct IdleConnection<C> {
    pub(crate) conn: C,
    pub(crate) meta: ConnectionMetadata,
    pub(crate) idle_since: Instant,
}

/// Internal metrics tracking.
#[derive(Debug, Default)]
pub(crate) struct PoolMetricsInner {
    /// Total connections created.
    pub(crate) connections_created: u64,
    /// Total connections closed.
    pub(crate) connections_closed: u64,
    /// Connections closed because of `max_uses` or `max_lifetime`.
    pub(crate) connections_recycled: u64,
    /// Total successful checkouts.
    pub(crate) checkouts_successful: u64,
    /// Total failed checkouts (timeouts, errors).
    pub(crate) checkouts_failed: u64,
    /// Checkouts that failed with a timeout.
    pub(crate) checkout_timeouts: u64,
    /// Total health checks performed.
    pub(crate) health_checks_performed: u64,
    /// Total health check failures.
    pub(crate) health_checks_failed: u64,
    /// Total resets performed.
    pub(crate) resets_performed: u64,
    /// Total reset failures.
    pub(crate) resets_failed: u64,
}

/// Holds one unit of `PoolState::total` for a connection that is being
/// opened or inspected. Dropping it without [`disarm`](Self::disarm) gives
/// the unit back, which keeps the count right when a caller's future is
/// cancelled mid-checkout.
struct SlotGuard<'a, L: ConnectionLifecycle> {
    inner: &'a PoolInner<L>,
    armed: bool,
}

impl<'a, L: ConnectionLifecycle> SlotGuard<'a, L> {
    fn new(inner: &'a PoolInner<L>) -> Self {
        Self { inner, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<L: ConnectionLifecycle> Drop for SlotGuard<'_, L> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.inner.state.lock();
            state.total = state.total.saturating_sub(1);
        }
    }
}

enum Candidate<C> {
    Idle(IdleConnection<C>),
    Open,
}

impl<L: ConnectionLifecycle> Pool<L> {
    /// Create a new pool builder.
    #[must_use]
    pub fn builder(lifecycle: L) -> PoolBuilder<L> {
        PoolBuilder::new(lifecycle)
    }

    /// Create a new pool with the given configuration and the default
    /// startup retry policy.
    pub async fn new(lifecycle: L, config: PoolConfig) -> Result<Self, PoolError> {
        PoolBuilder::new(lifecycle).pool_config(config).build().await
    }

    fn from_parts(lifecycle: L, config: PoolConfig) -> Self {
        let (phase, _) = watch::channel(ShutdownPhase::Running);
        let (outstanding, _) = watch::channel(0);

        let inner = Arc::new(PoolInner {
            semaphore: Arc::new(Semaphore::new(config.max_connections as usize)),
            config,
            lifecycle,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                leased: HashMap::new(),
                total: 0,
                in_use: 0,
                health: HealthState::Healthy,
                consecutive_failures: 0,
                last_check: None,
            }),
            phase,
            outstanding,
            background: CancellationToken::new(),
            leases: CancellationToken::new(),
            events: EventBus::new(),
            shutdown_report: Mutex::new(None),
            next_connection_id: AtomicU64::new(1),
            created_at: Instant::now(),
            metrics: Mutex::new(PoolMetricsInner::default()),
        });

        Self { inner }
    }

    /// Get a connection, waiting at most `timeout`.
    ///
    /// Returns an idle connection when one exists, otherwise opens a new one
    /// if the pool is below `max_connections`. At capacity the caller is
    /// suspended until a handle is released or the timeout elapses.
    ///
    /// Fails with [`PoolError::PoolClosed`] once shutdown has begun, without
    /// waiting.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection<L>, PoolError> {
        let result = self.checkout(timeout, true).await;
        self.inner.record_checkout(&result);
        result
    }

    /// Borrow a connection for a health check.
    ///
    /// Same admission path as [`acquire`](Self::acquire), but the borrow is
    /// invisible to checkout metrics and to the connection's use count, and
    /// returning it does not schedule a session reset.
    pub(crate) async fn acquire_uncounted(
        &self,
        timeout: Duration,
    ) -> Result<PooledConnection<L>, PoolError> {
        self.checkout(timeout, false).await
    }

    /// Get a connection using the configured acquire timeout.
    pub async fn get(&self) -> Result<PooledConnection<L>, PoolError> {
        self.acquire(self.inner.config.acquire_timeout).await
    }

    /// Try to get a connection without waiting for a free slot.
    ///
    /// Returns `None` if the pool is at capacity. May still open a new
    /// connection when the pool has room.
    pub async fn try_get(&self) -> Result<Option<PooledConnection<L>>, PoolError> {
        if !self.inner.is_running() {
            return Err(PoolError::PoolClosed);
        }

        let permit = match Arc::clone(&self.inner.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => return Ok(None),
            Err(TryAcquireError::Closed) => return Err(PoolError::PoolClosed),
        };

        let timeout = self.inner.config.acquire_timeout;
        let result = self
            .inner
            .checkout_with_permit(permit, Instant::now() + timeout, timeout, true)
            .await;
        self.inner.record_checkout(&result);
        result.map(Some)
    }

    /// Return a connection to the pool.
    ///
    /// Equivalent to dropping the handle. Never blocks and never fails.
    pub fn release(&self, conn: PooledConnection<L>) {
        if !Arc::ptr_eq(&self.inner, &conn.pool) {
            tracing::warn!(
                connection_id = conn.metadata.id,
                "connection released to a pool that does not own it"
            );
        }
        drop(conn);
    }

    async fn checkout(
        &self,
        timeout: Duration,
        counted: bool,
    ) -> Result<PooledConnection<L>, PoolError> {
        if !self.inner.is_running() {
            return Err(PoolError::PoolClosed);
        }

        tracing::trace!("acquiring connection from pool");

        let deadline = Instant::now() + timeout;
        let acquire = Arc::clone(&self.inner.semaphore).acquire_owned();
        let permit = match tokio::time::timeout_at(deadline, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::PoolClosed),
            Err(_) => return Err(PoolError::Timeout(timeout)),
        };

        self.inner
            .checkout_with_permit(permit, deadline, timeout, counted)
            .await
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            available: state.idle.len() as u32,
            in_use: state.in_use,
            total: state.total,
            max: self.inner.config.max_connections,
            health: state.health,
            last_check: state.last_check,
        }
    }

    /// Whether the pool is currently considered healthy.
    ///
    /// Advisory only; a degraded pool still serves `acquire`.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.inner.state.lock().health == HealthState::Healthy
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let inner = self.inner.metrics.lock();
        PoolMetrics {
            connections_created: inner.connections_created,
            connections_closed: inner.connections_closed,
            connections_recycled: inner.connections_recycled,
            checkouts_successful: inner.checkouts_successful,
            checkouts_failed: inner.checkouts_failed,
            checkout_timeouts: inner.checkout_timeouts,
            health_checks_performed: inner.health_checks_performed,
            health_checks_failed: inner.health_checks_failed,
            resets_performed: inner.resets_performed,
            resets_failed: inner.resets_failed,
            uptime: self.inner.created_at.elapsed(),
        }
    }

    /// Subscribe to pool events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Current shutdown phase.
    #[must_use]
    pub fn phase(&self) -> ShutdownPhase {
        *self.inner.phase.borrow()
    }

    /// Check if the pool has started shutting down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        !self.inner.is_running()
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get the backend lifecycle.
    #[must_use]
    pub fn lifecycle(&self) -> &L {
        &self.inner.lifecycle
    }

    fn spawn_reaper(&self) {
        let weak: Weak<PoolInner<L>> = Arc::downgrade(&self.inner);
        let token = self.inner.background.clone();
        let period = self.inner.config.reaper_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                inner.reap();
                inner.replenish().await;
            }

            tracing::debug!("pool reaper stopped");
        });
    }
}

impl<L: ConnectionLifecycle> PoolInner<L> {
    pub(crate) fn is_running(&self) -> bool {
        *self.phase.borrow() == ShutdownPhase::Running
    }

    /// Generate a new unique connection ID.
    fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    fn record_checkout(&self, result: &Result<PooledConnection<L>, PoolError>) {
        let mut metrics = self.metrics.lock();
        match result {
            Ok(_) => metrics.checkouts_successful += 1,
            Err(PoolError::Timeout(_)) => {
                metrics.checkouts_failed += 1;
                metrics.checkout_timeouts += 1;
            }
            Err(_) => metrics.checkouts_failed += 1,
        }
    }

    async fn checkout_with_permit(
        self: &Arc<Self>,
        permit: OwnedSemaphorePermit,
        deadline: Instant,
        timeout: Duration,
        counted: bool,
    ) -> Result<PooledConnection<L>, PoolError> {
        loop {
            let candidate = {
                let mut state = self.state.lock();
                match state.idle.pop_back() {
                    Some(idle) => Candidate::Idle(idle),
                    None => {
                        state.total += 1;
                        Candidate::Open
                    }
                }
            };
            let reserved = SlotGuard::new(self);

            match candidate {
                Candidate::Idle(IdleConnection {
                    mut conn, mut meta, ..
                }) => {
                    if meta.is_expired(self.config.max_lifetime) {
                        drop(conn);
                        drop(reserved);
                        self.connection_closed(meta.id, CloseReason::MaxLifetime);
                        continue;
                    }

                    if self.config.reset_on_return && meta.needs_reset {
                        let reset = self.lifecycle.reset(&mut conn);
                        match tokio::time::timeout_at(deadline, reset).await {
                            Ok(Ok(())) => {
                                meta.needs_reset = false;
                                self.metrics.lock().resets_performed += 1;
                            }
                            Ok(Err(e)) => {
                                tracing::warn!(
                                    connection_id = meta.id,
                                    error = %e,
                                    "connection reset failed, discarding"
                                );
                                self.metrics.lock().resets_failed += 1;
                                drop(conn);
                                drop(reserved);
                                self.connection_closed(meta.id, CloseReason::ResetFailed);
                                continue;
                            }
                            Err(_) => {
                                self.metrics.lock().resets_failed += 1;
                                drop(conn);
                                drop(reserved);
                                self.connection_closed(meta.id, CloseReason::ResetFailed);
                                return Err(PoolError::Timeout(timeout));
                            }
                        }
                    }

                    return self.hand_out(conn, meta, permit, reserved, counted);
                }
                Candidate::Open => {
                    let conn = match tokio::time::timeout_at(deadline, self.lifecycle.connect())
                        .await
                    {
                        Ok(Ok(conn)) => conn,
                        Ok(Err(e)) => {
                            tracing::warn!(error = %e, "failed to open connection");
                            return Err(PoolError::backend(e));
                        }
                        Err(_) => return Err(PoolError::Timeout(timeout)),
                    };
                    let meta = self.connection_opened();
                    return self.hand_out(conn, meta, permit, reserved, counted);
                }
            }
        }
    }

    fn hand_out(
        self: &Arc<Self>,
        conn: L::Connection,
        mut meta: ConnectionMetadata,
        permit: OwnedSemaphorePermit,
        reserved: SlotGuard<'_, L>,
        counted: bool,
    ) -> Result<PooledConnection<L>, PoolError> {
        let slot: Slot<L::Connection> = Arc::new(AsyncMutex::new(Some(conn)));
        {
            let mut state = self.state.lock();
            if *self.phase.borrow() == ShutdownPhase::Running {
                state.leased.insert(meta.id, Arc::clone(&slot));
                state.in_use += 1;
                self.outstanding.send_replace(state.in_use);
                drop(state);
                reserved.disarm();

                if counted {
                    meta.use_count += 1;
                    meta.last_checkout = Some(Instant::now());
                }

                tracing::trace!(
                    connection_id = meta.id,
                    use_count = meta.use_count,
                    counted,
                    "connection checked out"
                );

                return Ok(PooledConnection {
                    slot,
                    metadata: meta,
                    pool: Arc::clone(self),
                    lease: self.leases.child_token(),
                    broken: false,
                    counted,
                    _permit: permit,
                });
            }
        }

        // Shutdown started while this checkout was in flight.
        drop(slot);
        drop(reserved);
        self.connection_closed(meta.id, CloseReason::Shutdown);
        Err(PoolError::PoolClosed)
    }

    fn checkin(
        &self,
        slot: &Slot<L::Connection>,
        mut meta: ConnectionMetadata,
        broken: bool,
        counted: bool,
    ) {
        let mut state = self.state.lock();
        if state.leased.remove(&meta.id).is_none() {
            // Already revoked or detached; the pool no longer owns it.
            return;
        }
        state.in_use = state.in_use.saturating_sub(1);
        self.outstanding.send_replace(state.in_use);

        let taken = slot.try_lock().ok().and_then(|mut conn| conn.take());
        let Some(conn) = taken else {
            state.total = state.total.saturating_sub(1);
            return;
        };

        let reason = if broken {
            Some(CloseReason::Broken)
        } else if *self.phase.borrow() != ShutdownPhase::Running {
            Some(CloseReason::Shutdown)
        } else if meta.is_worn_out(self.config.max_uses) {
            Some(CloseReason::MaxUses)
        } else if meta.is_expired(self.config.max_lifetime) {
            Some(CloseReason::MaxLifetime)
        } else {
            None
        };

        match reason {
            Some(reason) => {
                state.total = state.total.saturating_sub(1);
                drop(state);
                drop(conn);
                self.connection_closed(meta.id, reason);
            }
            None => {
                meta.needs_reset |= counted;
                tracing::trace!(connection_id = meta.id, "returning connection to pool");
                state.idle.push_back(IdleConnection {
                    conn,
                    meta,
                    idle_since: Instant::now(),
                });
            }
        }
    }

    /// Stop accounting for a leased connection. Returns `false` if the lease
    /// was already revoked.
    fn detached(&self, id: u64) -> bool {
        {
            let mut state = self.state.lock();
            if state.leased.remove(&id).is_none() {
                return false;
            }
            state.in_use = state.in_use.saturating_sub(1);
            state.total = state.total.saturating_sub(1);
            self.outstanding.send_replace(state.in_use);
        }
        self.events.publish(PoolEvent::ConnectionClosed {
            id,
            reason: CloseReason::Detached,
        });
        true
    }

    fn connection_opened(&self) -> ConnectionMetadata {
        let meta = ConnectionMetadata::new(self.next_connection_id());
        self.metrics.lock().connections_created += 1;
        tracing::debug!(connection_id = meta.id, "connection opened");
        self.events
            .publish(PoolEvent::ConnectionCreated { id: meta.id });
        meta
    }

    pub(crate) fn connection_closed(&self, id: u64, reason: CloseReason) {
        {
            let mut metrics = self.metrics.lock();
            metrics.connections_closed += 1;
            if matches!(reason, CloseReason::MaxUses | CloseReason::MaxLifetime) {
                metrics.connections_recycled += 1;
            }
        }
        tracing::debug!(connection_id = id, reason = ?reason, "connection closed");
        self.events
            .publish(PoolEvent::ConnectionClosed { id, reason });
    }

    /// Add a connection opened outside the checkout path as idle.
    fn adopt(&self, conn: L::Connection) {
        let meta = self.connection_opened();
        let mut state = self.state.lock();
        state.total += 1;
        state.idle.push_back(IdleConnection {
            conn,
            meta,
            idle_since: Instant::now(),
        });
    }

    /// Close idle connections that are expired, or idle too long while the
    /// pool is above its minimum size. Oldest-returned connections go first.
    pub(crate) fn reap(&self) {
        let now = Instant::now();
        let mut closed = Vec::new();
        {
            let mut state = self.state.lock();
            let mut kept = VecDeque::with_capacity(state.idle.len());
            while let Some(idle) = state.idle.pop_front() {
                if idle.meta.is_expired(self.config.max_lifetime) {
                    state.total = state.total.saturating_sub(1);
                    closed.push((idle, CloseReason::MaxLifetime));
                } else if state.total > self.config.min_connections
                    && now.duration_since(idle.idle_since) >= self.config.idle_timeout
                {
                    state.total = state.total.saturating_sub(1);
                    closed.push((idle, CloseReason::IdleTimeout));
                } else {
                    kept.push_back(idle);
                }
            }
            state.idle = kept;
        }

        for (idle, reason) in closed {
            let id = idle.meta.id;
            drop(idle);
            self.connection_closed(id, reason);
        }
    }

    /// Open idle connections until the pool holds `min_connections`.
    ///
    /// Each new connection holds an admission permit while it is being
    /// opened so that replenishing never pushes the pool past its maximum.
    pub(crate) async fn replenish(&self) {
        loop {
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                return;
            };
            {
                let mut state = self.state.lock();
                if !self.is_running() || state.total >= self.config.min_connections {
                    return;
                }
                state.total += 1;
            }
            let reserved = SlotGuard::new(self);

            match self.lifecycle.connect().await {
                Ok(conn) => {
                    let meta = self.connection_opened();
                    let mut state = self.state.lock();
                    if *self.phase.borrow() != ShutdownPhase::Running {
                        drop(state);
                        drop(conn);
                        drop(reserved);
                        self.connection_closed(meta.id, CloseReason::Shutdown);
                        return;
                    }
                    state.idle.push_back(IdleConnection {
                        conn,
                        meta,
                        idle_since: Instant::now(),
                    });
                    drop(state);
                    reserved.disarm();
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to open connection while replenishing pool");
                    return;
                }
            }
            drop(permit);
        }
    }

    /// Close every idle connection. Used when shutdown starts.
    pub(crate) fn close_idle(&self) {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(drained.len() as u32);
            drained
        };
        for idle in drained {
            let id = idle.meta.id;
            drop(idle);
            self.connection_closed(id, CloseReason::Shutdown);
        }
    }

    /// Take every leased connection back from its borrower and close it.
    ///
    /// Revokes all handles first. A connection whose borrower holds its
    /// guard at this moment is closed as soon as the guard is released; the
    /// handle itself never sees it again either way.
    pub(crate) fn force_close_leases(&self) {
        self.leases.cancel();

        let revoked: Vec<_> = {
            let mut state = self.state.lock();
            let revoked: Vec<_> = state.leased.drain().collect();
            state.total = state.total.saturating_sub(revoked.len() as u32);
            state.in_use = 0;
            self.outstanding.send_replace(0);
            revoked
        };

        for (id, slot) in revoked {
            let closed = slot.try_lock().map(|mut conn| drop(conn.take())).is_ok();
            if !closed {
                tracing::debug!(connection_id = id, "connection busy, closing once released");
                tokio::spawn(async move {
                    drop(slot.lock().await.take());
                });
            }
            self.connection_closed(id, CloseReason::Revoked);
        }
    }
}

impl<L: ConnectionLifecycle> Drop for PoolInner<L> {
    fn drop(&mut self) {
        self.background.cancel();
    }
}

/// Builder for creating a connection pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = Pool::builder(lifecycle)
///     .pool_config(pool_config)
///     .retry_policy(RetryPolicy::default())
///     .build()
///     .await?;
/// ```
pub struct PoolBuilder<L: ConnectionLifecycle> {
    lifecycle: L,
    pool_config: PoolConfig,
    retry_policy: RetryPolicy,
}

impl<L: ConnectionLifecycle> PoolBuilder<L> {
    /// Create a new pool builder with default settings.
    pub fn new(lifecycle: L) -> Self {
        Self {
            lifecycle,
            pool_config: PoolConfig::default(),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Set the pool configuration.
    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Set the startup retry policy.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.pool_config.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.pool_config.max_connections = count;
        self
    }

    /// Set the default acquire timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.acquire_timeout = timeout;
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.idle_timeout = timeout;
        self
    }

    /// Set the maximum connection lifetime.
    #[must_use]
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.pool_config.max_lifetime = lifetime;
        self
    }

    /// Set the per-connection use limit.
    #[must_use]
    pub fn max_uses(mut self, uses: u64) -> Self {
        self.pool_config.max_uses = uses;
        self
    }

    /// Enable or disable session reset between checkouts.
    #[must_use]
    pub fn reset_on_return(mut self, enabled: bool) -> Self {
        self.pool_config.reset_on_return = enabled;
        self
    }

    /// Set the reaper interval.
    #[must_use]
    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.pool_config.reaper_interval = interval;
        self
    }

    /// Set the shutdown grace period.
    #[must_use]
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.pool_config.shutdown_grace = grace;
        self
    }

    /// Build the pool.
    ///
    /// Validates the configuration, opens the first connection under the
    /// retry policy, warms the pool up to `min_connections` and starts the
    /// reaper. Fails with [`PoolError::Config`] or
    /// [`PoolError::Connection`]; both are fatal to startup.
    pub async fn build(self) -> Result<Pool<L>, PoolError> {
        self.pool_config.validate()?;

        let first = connect_with_retry(&self.lifecycle, &self.retry_policy).await?;

        let pool = Pool::from_parts(self.lifecycle, self.pool_config);
        pool.inner.adopt(first);
        pool.inner.replenish().await;
        pool.spawn_reaper();

        tracing::info!(
            min = pool.inner.config.min_connections,
            max = pool.inner.config.max_connections,
            "connection pool created"
        );

        Ok(pool)
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    /// Number of idle connections available.
    pub available: u32,
    /// Number of connections currently in use.
    pub in_use: u32,
    /// Total number of connections.
    pub total: u32,
    /// Maximum allowed connections.
    pub max: u32,
    /// Advisory health flag.
    pub health: HealthState,
    /// When the last health probe finished.
    pub last_check: Option<Instant>,
}

impl PoolStatus {
    /// Calculate the utilization percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (self.in_use as f64 / self.max as f64) * 100.0
    }

    /// Check if the pool is at capacity.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.total >= self.max
    }
}

/// Metrics collected from the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Total connections created since pool start.
    pub connections_created: u64,
    /// Total connections closed since pool start.
    pub connections_closed: u64,
    /// Connections recycled for reaching `max_uses` or `max_lifetime`.
    pub connections_recycled: u64,
    /// Successful connection checkouts.
    pub checkouts_successful: u64,
    /// Failed connection checkouts (timeouts, pool closed, etc.).
    pub checkouts_failed: u64,
    /// Checkouts that timed out.
    pub checkout_timeouts: u64,
    /// Health checks performed.
    pub health_checks_performed: u64,
    /// Health checks that failed.
    pub health_checks_failed: u64,
    /// Connection resets performed.
    pub resets_performed: u64,
    /// Connection resets that failed.
    pub resets_failed: u64,
    /// Time since pool creation.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Calculate checkout success rate (0.0 to 1.0).
    #[must_use]
    pub fn checkout_success_rate(&self) -> f64 {
        let total = self.checkouts_successful + self.checkouts_failed;
        if total == 0 {
            return 1.0;
        }
        self.checkouts_successful as f64 / total as f64
    }

    /// Calculate health check success rate (0.0 to 1.0).
    #[must_use]
    pub fn health_check_success_rate(&self) -> f64 {
        if self.health_checks_performed == 0 {
            return 1.0;
        }
        let successful = self.health_checks_performed - self.health_checks_failed;
        successful as f64 / self.health_checks_performed as f64
    }
}

/// A connection handle leased from the pool.
///
/// The connection is reached through [`connection`](Self::connection). When
/// the handle is dropped the connection goes back to the pool, or is
/// destroyed if it has reached its use or lifetime limit, was marked
/// broken, or the pool is shutting down.
///
/// If shutdown's grace period runs out while the handle is still held, the
/// pool takes the connection back and closes it. From then on
/// `connection` fails with [`PoolError::PoolClosed`].
pub struct PooledConnection<L: ConnectionLifecycle> {
    /// Shared with the pool's lease table.
    slot: Slot<L::Connection>,
    /// Connection metadata.
    metadata: ConnectionMetadata,
    /// Reference to the pool for returning the connection.
    pool: Arc<PoolInner<L>>,
    /// Cancelled if the pool force-closes while this handle is out.
    lease: CancellationToken,
    /// Destroy instead of recycling on return.
    broken: bool,
    /// Counts toward use limits and session resets.
    counted: bool,
    /// Admission slot, released after the connection is back in the pool.
    _permit: OwnedSemaphorePermit,
}

impl<L: ConnectionLifecycle> PooledConnection<L> {
    /// Lock the connection for use.
    ///
    /// Fails with [`PoolError::PoolClosed`] once the lease is revoked. Drop
    /// the guard before calling [`mark_broken`](Self::mark_broken) or
    /// releasing the handle.
    pub async fn connection(&self) -> Result<MappedMutexGuard<'_, L::Connection>, PoolError> {
        if self.is_revoked() {
            return Err(PoolError::PoolClosed);
        }
        let guard = self.slot.lock().await;
        AsyncMutexGuard::try_map(guard, Option::as_mut).map_err(|_| PoolError::PoolClosed)
    }

    /// Get the connection metadata.
    #[must_use]
    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.metadata
    }

    /// Mark the connection as unusable so it is destroyed on release.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Whether the pool force-closed while this handle was checked out.
    ///
    /// A revoked handle must not be used for new work.
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.lease.is_cancelled()
    }

    /// Resolve when the pool force-closes this lease.
    pub async fn revoked(&self) {
        self.lease.cancelled().await;
    }

    /// A token cancelled when the pool force-closes this lease, for use in
    /// `select!` alongside in-flight work.
    #[must_use]
    pub fn revocation_token(&self) -> CancellationToken {
        self.lease.clone()
    }

    /// Detach the connection from the pool.
    ///
    /// The pool stops accounting for it and the slot is freed for a
    /// replacement. Returns `None` if the lease was already revoked.
    pub fn detach(self) -> Option<L::Connection> {
        if !self.pool.detached(self.metadata.id) {
            return None;
        }
        self.slot.try_lock().ok().and_then(|mut conn| conn.take())
    }
}

impl<L: ConnectionLifecycle> Drop for PooledConnection<L> {
    fn drop(&mut self) {
        self.pool
            .checkin(&self.slot, self.metadata.clone(), self.broken, self.counted);
    }
}

impl<L: ConnectionLifecycle> fmt::Debug for PooledConnection<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("metadata", &self.metadata)
            .field("broken", &self.broken)
            .field("revoked", &self.lease.is_cancelled())
            .finish()
    }
}

impl<L: ConnectionLifecycle> fmt::Debug for Pool<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NullLifecycle;

    #[derive(Debug, thiserror::Error)]
    #[error("null backend")]
    struct NullError;

    #[async_trait]
    impl ConnectionLifecycle for NullLifecycle {
        type Connection = ();
        type Error = NullError;

        async fn connect(&self) -> Result<(), NullError> {
            Ok(())
        }

        async fn health_check(&self, _conn: &mut ()) -> Result<(), NullError> {
            Ok(())
        }
    }

    #[test]
    fn test_pool_status_utilization() {
        let status = PoolStatus {
            available: 5,
            in_use: 5,
            total: 10,
            max: 20,
            health: HealthState::Healthy,
            last_check: None,
        };
        assert!((status.utilization() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_status_at_capacity() {
        let status = PoolStatus {
            available: 0,
            in_use: 10,
            total: 10,
            max: 10,
            health: HealthState::Healthy,
            last_check: None,
        };
        assert!(status.is_at_capacity());

        let status2 = PoolStatus {
            available: 5,
            in_use: 5,
            total: 10,
            max: 20,
            health: HealthState::Degraded,
            last_check: None,
        };
        assert!(!status2.is_at_capacity());
    }

    #[test]
    fn test_pool_metrics_success_rates() {
        let metrics = PoolMetrics {
            connections_created: 10,
            connections_closed: 2,
            connections_recycled: 1,
            checkouts_successful: 90,
            checkouts_failed: 10,
            checkout_timeouts: 4,
            health_checks_performed: 100,
            health_checks_failed: 5,
            resets_performed: 80,
            resets_failed: 2,
            uptime: Duration::from_secs(3600),
        };

        assert!((metrics.checkout_success_rate() - 0.9).abs() < f64::EPSILON);
        assert!((metrics.health_check_success_rate() - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn test_builder_default() {
        let builder = PoolBuilder::new(NullLifecycle);
        assert_eq!(builder.pool_config.min_connections, 1);
        assert_eq!(builder.pool_config.max_connections, 10);
        assert!(builder.pool_config.reset_on_return);
    }

    #[test]
    fn test_builder_fluent() {
        let builder = Pool::builder(NullLifecycle)
            .min_connections(5)
            .max_connections(50)
            .max_uses(100)
            .reset_on_return(false);

        assert_eq!(builder.pool_config.min_connections, 5);
        assert_eq!(builder.pool_config.max_connections, 50);
        assert_eq!(builder.pool_config.max_uses, 100);
        assert!(!builder.pool_config.reset_on_return);
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let err = Pool::builder(NullLifecycle)
            .min_connections(3)
            .max_connections(2)
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));
    }

    #[tokio::test]
    async fn test_build_warms_to_min() {
        let pool = Pool::builder(NullLifecycle)
            .min_connections(3)
            .max_connections(5)
            .build()
            .await
            .unwrap();

        let status = pool.status();
        assert_eq!(status.total, 3);
        assert_eq!(status.available, 3);
        assert_eq!(status.in_use, 0);
        assert!(pool.is_healthy());
    }

    #[tokio::test]
    async fn test_detach_frees_slot() {
        let pool = Pool::builder(NullLifecycle)
            .min_connections(1)
            .max_connections(1)
            .build()
            .await
            .unwrap();

        let conn = pool.acquire(Duration::from_millis(10)).await.unwrap();
        assert!(conn.detach().is_some());

        let status = pool.status();
        assert_eq!(status.total, 0);
        assert_eq!(status.in_use, 0);

        // The freed slot admits a replacement.
        let again = pool.acquire(Duration::from_millis(10)).await.unwrap();
        assert_eq!(again.metadata().id, 2);
    }
}
