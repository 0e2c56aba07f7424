//! Periodic liveness probing.
//!
//! The monitor borrows a connection on a fixed interval, runs the backend's
//! trivial round trip and releases it. Consecutive failures past the
//! threshold flip the pool to [`HealthState::Degraded`]; one success flips
//! it back. The flag is advisory and never blocks `acquire`.

use std::fmt;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::PoolError;
use crate::events::PoolEvent;
use crate::lifecycle::{ConnectionLifecycle, HealthCheckResult};
use crate::pool::{Pool, PoolInner};

/// Advisory health flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthState {
    /// Recent probes succeeded.
    Healthy,
    /// The failure threshold was reached.
    Degraded,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            Self::Degraded => f.write_str("degraded"),
        }
    }
}

/// Health monitor settings.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Time between probes.
    pub interval: Duration,
    /// Consecutive failures that mark the pool degraded.
    pub failure_threshold: u32,
    /// How long a probe waits for a free connection before skipping.
    pub probe_acquire_timeout: Duration,
    /// How long the probe query may take.
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            failure_threshold: 3,
            probe_acquire_timeout: Duration::from_millis(250),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl HealthConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the probe interval.
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the failure threshold.
    #[must_use]
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the probe acquire sub-timeout.
    #[must_use]
    pub fn probe_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.probe_acquire_timeout = timeout;
        self
    }

    /// Set the probe query timeout.
    #[must_use]
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.interval.is_zero() {
            return Err(PoolError::Config("health interval must be greater than zero".into()));
        }
        if self.failure_threshold == 0 {
            return Err(PoolError::Config(
                "health failure threshold must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Result of one probe attempt.
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    /// The round trip succeeded.
    Healthy(HealthCheckResult),
    /// The round trip, or opening a connection for it, failed.
    Failed(HealthCheckResult),
    /// No connection was free within the sub-timeout.
    Skipped,
}

/// Background liveness prober for a pool.
pub struct HealthMonitor<L: ConnectionLifecycle> {
    pool: Pool<L>,
    config: HealthConfig,
}

impl<L: ConnectionLifecycle> HealthMonitor<L> {
    /// Create a monitor for `pool`.
    pub fn new(pool: Pool<L>, config: HealthConfig) -> Self {
        Self { pool, config }
    }

    /// Monitor settings.
    #[must_use]
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Run a single probe and record its result.
    ///
    /// The borrowed connection does not count as a checkout: use limits,
    /// session resets and checkout metrics see only application traffic.
    pub async fn probe_once(&self) -> ProbeOutcome {
        let mut conn = match self
            .pool
            .acquire_uncounted(self.config.probe_acquire_timeout)
            .await
        {
            Ok(conn) => conn,
            Err(PoolError::Timeout(_)) => {
                tracing::debug!("no connection free for health probe, skipping");
                self.pool.inner.events.publish(PoolEvent::ProbeSkipped);
                return ProbeOutcome::Skipped;
            }
            Err(PoolError::PoolClosed) => return ProbeOutcome::Skipped,
            Err(e) => {
                let result = HealthCheckResult::failure(Duration::ZERO, e.to_string());
                self.pool
                    .inner
                    .record_probe(&result, self.config.failure_threshold);
                return ProbeOutcome::Failed(result);
            }
        };

        let started = Instant::now();
        let result = {
            let Ok(mut guard) = conn.connection().await else {
                return ProbeOutcome::Skipped;
            };
            let probe = self.pool.lifecycle().health_check(&mut *guard);
            match tokio::time::timeout(self.config.probe_timeout, probe).await {
                Ok(Ok(())) => HealthCheckResult::success(started.elapsed()),
                Ok(Err(e)) => HealthCheckResult::failure(started.elapsed(), e.to_string()),
                Err(_) => HealthCheckResult::failure(started.elapsed(), "probe timed out"),
            }
        };
        if !result.healthy {
            conn.mark_broken();
        }
        self.pool.release(conn);

        self.pool
            .inner
            .record_probe(&result, self.config.failure_threshold);

        if result.healthy {
            ProbeOutcome::Healthy(result)
        } else {
            ProbeOutcome::Failed(result)
        }
    }

    /// Probe on the configured interval until the pool starts shutting down.
    pub async fn run(self) {
        let token = self.pool.inner.background.clone();
        let period = self.config.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(interval_ms = period.as_millis() as u64, "health monitor started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.probe_once() => {}
            }
        }

        tracing::debug!("health monitor stopped");
    }

    /// Run the monitor as a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

impl<L: ConnectionLifecycle> PoolInner<L> {
    /// Fold a probe result into the pool's health state.
    pub(crate) fn record_probe(
        &self,
        result: &HealthCheckResult,
        threshold: u32,
    ) -> Option<(HealthState, HealthState)> {
        {
            let mut metrics = self.metrics.lock();
            metrics.health_checks_performed += 1;
            if !result.healthy {
                metrics.health_checks_failed += 1;
            }
        }

        let (transition, failures) = {
            let mut state = self.state.lock();
            state.last_check = Some(Instant::now());
            let before = state.health;

            if result.healthy {
                state.consecutive_failures = 0;
                state.health = HealthState::Healthy;
            } else {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= threshold {
                    state.health = HealthState::Degraded;
                }
            }

            let transition = (before != state.health).then_some((before, state.health));
            (transition, state.consecutive_failures)
        };

        if !result.healthy {
            let err = PoolError::HealthCheck(result.error.clone().unwrap_or_default());
            tracing::warn!(error = %err, consecutive_failures = failures, "health probe failed");
        }

        if let Some((from, to)) = transition {
            match to {
                HealthState::Degraded => {
                    tracing::warn!(from = %from, to = %to, "connection pool health changed")
                }
                HealthState::Healthy => {
                    tracing::info!(from = %from, to = %to, "connection pool health changed")
                }
            }
            self.events.publish(PoolEvent::HealthChanged { from, to });
        }

        transition
    }
}
