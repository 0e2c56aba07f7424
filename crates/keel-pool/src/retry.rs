//! Startup connection retry with exponential backoff.

use std::time::Duration;

use crate::error::PoolError;
use crate::lifecycle::ConnectionLifecycle;

/// Bounded exponential backoff for the first connection.
///
/// With the defaults, a failing first attempt is retried up to five times,
/// sleeping 1000, 2000, 4000, 8000 and 16000 ms before retries one through
/// five. The sixth consecutive failure is returned as
/// [`PoolError::Connection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Factor applied to the delay after each retry.
    pub multiplier: u32,
    /// Upper bound on any single delay.
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(1000),
            multiplier: 2,
            max_delay: None,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that tries exactly once.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Set the number of retries.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the first delay.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the backoff multiplier.
    #[must_use]
    pub fn multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Cap individual delays.
    #[must_use]
    pub fn max_delay(mut self, cap: Duration) -> Self {
        self.max_delay = Some(cap);
        self
    }

    /// Total attempts, including the first.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before the `retry`-th retry (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.max(1) - 1;
        let delay = self
            .initial_delay
            .saturating_mul(self.multiplier.saturating_pow(exponent));
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// The full delay sequence, one entry per retry.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_retries).map(move |retry| self.delay_for(retry))
    }
}

/// Open one connection, retrying under `policy`.
///
/// Every failure is logged; exhausting the policy returns
/// [`PoolError::Connection`] carrying the last backend error. Sleeping uses
/// the tokio timer, so tests can drive the backoff with a paused clock.
pub async fn connect_with_retry<L: ConnectionLifecycle>(
    lifecycle: &L,
    policy: &RetryPolicy,
) -> Result<L::Connection, PoolError> {
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match lifecycle.connect().await {
            Ok(conn) => {
                if attempt > 1 {
                    tracing::info!(attempt, "database reachable");
                }
                return Ok(conn);
            }
            Err(e) if attempt > policy.max_retries => {
                tracing::error!(
                    attempts = attempt,
                    error = %e,
                    "database unreachable, giving up"
                );
                return Err(PoolError::Connection {
                    attempts: attempt,
                    source: Box::new(e),
                });
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts(),
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_sequence() {
        let delays: Vec<u64> = RetryPolicy::default()
            .delays()
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
        assert_eq!(RetryPolicy::default().max_attempts(), 6);
    }

    #[test]
    fn test_cap_applies() {
        let policy = RetryPolicy::new()
            .max_retries(8)
            .max_delay(Duration::from_secs(10));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for(8), Duration::from_secs(10));
    }

    #[test]
    fn test_no_retry() {
        assert_eq!(RetryPolicy::no_retry().delays().count(), 0);
        assert_eq!(RetryPolicy::no_retry().max_attempts(), 1);
    }

    proptest! {
        #[test]
        fn prop_each_delay_doubles(initial_ms in 1u64..10_000, retry in 1u32..12) {
            let policy = RetryPolicy::new()
                .initial_delay(Duration::from_millis(initial_ms))
                .max_retries(16);
            prop_assert_eq!(policy.delay_for(retry + 1), policy.delay_for(retry) * 2);
        }

        #[test]
        fn prop_capped_delays_never_exceed_cap(cap_ms in 1u64..60_000, retries in 0u32..40) {
            let cap = Duration::from_millis(cap_ms);
            let policy = RetryPolicy::new().max_retries(retries).max_delay(cap);
            prop_assert!(policy.delays().all(|d| d <= cap));
            prop_assert_eq!(policy.delays().count(), retries as usize);
        }
    }
}
