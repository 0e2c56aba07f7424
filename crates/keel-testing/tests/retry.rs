//! Startup retry with exponential backoff.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use keel_pool::{Pool, PoolError, RetryPolicy, connect_with_retry};
use keel_testing::{MockError, MockLifecycle};
use tokio::time::Instant;

fn secs(values: &[u64]) -> Vec<Duration> {
    values.iter().copied().map(Duration::from_secs).collect()
}

#[tokio::test(start_paused = true)]
async fn test_five_failures_back_off_then_connect() {
    let mock = MockLifecycle::new();
    mock.fail_connects(5);

    let pool = Pool::builder(mock.clone()).build().await.unwrap();

    assert_eq!(mock.connect_attempts().len(), 6);
    assert_eq!(mock.connect_gaps(), secs(&[1, 2, 4, 8, 16]));
    assert_eq!(pool.status().total, 1);
}

#[tokio::test(start_paused = true)]
async fn test_sixth_failure_is_fatal() {
    let mock = MockLifecycle::new();
    mock.fail_connects(6);

    let started = Instant::now();
    let err = Pool::builder(mock.clone()).build().await.unwrap_err();

    match err {
        PoolError::Connection { attempts, source } => {
            assert_eq!(attempts, 6);
            let last = source.downcast_ref::<MockError>().unwrap();
            assert_eq!(*last, MockError::ConnectionRefused { attempt: 6 });
        }
        other => panic!("expected a connection error, got {other:?}"),
    }
    assert_eq!(started.elapsed(), Duration::from_secs(31));
    assert_eq!(mock.connections_opened(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_immediate_success_does_not_sleep() {
    let mock = MockLifecycle::new();

    let started = Instant::now();
    connect_with_retry(&mock, &RetryPolicy::default())
        .await
        .unwrap();
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(mock.connect_attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_custom_policy_is_capped() {
    let mock = MockLifecycle::new();
    mock.fail_connects(10);

    let policy = RetryPolicy::new()
        .max_retries(3)
        .initial_delay(Duration::from_millis(500))
        .multiplier(3)
        .max_delay(Duration::from_secs(2));
    let err = connect_with_retry(&mock, &policy).await.unwrap_err();

    assert!(matches!(err, PoolError::Connection { attempts: 4, .. }));
    assert_eq!(
        mock.connect_gaps(),
        vec![
            Duration::from_millis(500),
            Duration::from_millis(1500),
            Duration::from_secs(2),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_invalid_config_fails_before_connecting() {
    let mock = MockLifecycle::new();

    let err = Pool::builder(mock.clone())
        .max_connections(0)
        .build()
        .await
        .unwrap_err();

    assert!(matches!(err, PoolError::Config(_)));
    assert!(mock.connect_attempts().is_empty());
}
