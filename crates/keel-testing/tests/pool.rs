//! Pool capacity, admission and recycling behavior.
//!
//! All timing assertions run on tokio's paused clock, so `2000ms` means
//! exactly two virtual seconds.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use keel_pool::{CloseReason, PoolError, PoolEvent};
use keel_testing::{MockLifecycle, builder, pool_with};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_test::{assert_pending, assert_ready};

fn drain(events: &mut broadcast::Receiver<PoolEvent>) -> Vec<PoolEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

// =============================================================================
// Capacity
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_twelve_callers_on_ten_slots_two_time_out() {
    let mock = MockLifecycle::new();
    let pool = pool_with(&mock, 1, 10).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..12 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let started = Instant::now();
            let result = pool.acquire(Duration::from_millis(2000)).await;
            (result, started.elapsed())
        }));
    }

    let mut held = Vec::new();
    let mut timeouts = Vec::new();
    for task in tasks {
        match task.await.unwrap() {
            (Ok(conn), waited) => {
                assert_eq!(waited, Duration::ZERO);
                held.push(conn);
            }
            (Err(PoolError::Timeout(limit)), waited) => {
                assert_eq!(limit, Duration::from_millis(2000));
                timeouts.push(waited);
            }
            (Err(e), _) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(held.len(), 10);
    assert_eq!(timeouts.len(), 2);
    assert!(timeouts.iter().all(|w| *w >= Duration::from_millis(2000)));

    let status = pool.status();
    assert_eq!(status.in_use, 10);
    assert_eq!(status.total, 10);
    assert!(status.is_at_capacity());
    assert_eq!(pool.metrics().checkout_timeouts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_callers_within_capacity_succeed_immediately() {
    let mock = MockLifecycle::new();
    let pool = pool_with(&mock, 2, 6).await.unwrap();

    let started = Instant::now();
    let mut held = Vec::new();
    for _ in 0..6 {
        held.push(pool.acquire(Duration::from_millis(100)).await.unwrap());
    }
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(pool.status().in_use, 6);
    assert_eq!(mock.connections_opened(), 6);
}

#[tokio::test]
async fn test_over_capacity_caller_suspends_until_release() {
    let mock = MockLifecycle::new();
    let pool = pool_with(&mock, 1, 1).await.unwrap();

    let held = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let mut waiter = tokio_test::task::spawn(pool.acquire(Duration::from_secs(30)));
    assert_pending!(waiter.poll());

    pool.release(held);
    assert!(waiter.is_woken());

    let conn = assert_ready!(waiter.poll()).unwrap();
    assert_eq!(conn.metadata().id, 1);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_waiter_does_not_leak_a_slot() {
    let mock = MockLifecycle::new();
    let pool = pool_with(&mock, 1, 1).await.unwrap();

    let held = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let err = pool.acquire(Duration::from_millis(10)).await.unwrap_err();
    assert!(matches!(err, PoolError::Timeout(_)));
    assert!(err.is_transient());

    drop(held);
    let again = pool.acquire(Duration::from_millis(10)).await.unwrap();
    assert_eq!(again.metadata().id, 1);
    assert_eq!(pool.status().total, 1);
}

#[tokio::test(start_paused = true)]
async fn test_try_get_at_capacity_returns_none() {
    let mock = MockLifecycle::new();
    let pool = pool_with(&mock, 1, 1).await.unwrap();

    let held = pool.try_get().await.unwrap().expect("slot is free");
    assert!(pool.try_get().await.unwrap().is_none());
    drop(held);
    assert!(pool.try_get().await.unwrap().is_some());
}

// =============================================================================
// Recycling
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_connection_recycled_after_max_uses() {
    let mock = MockLifecycle::new();
    let pool = builder(&mock)
        .min_connections(1)
        .max_connections(1)
        .max_uses(3)
        .build()
        .await
        .unwrap();
    let mut events = pool.subscribe();

    for _ in 0..3 {
        let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(conn.metadata().id, 1);
        pool.release(conn);
    }

    let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_eq!(conn.metadata().id, 2);
    assert_eq!(conn.metadata().use_count, 1);

    assert!(drain(&mut events).contains(&PoolEvent::ConnectionClosed {
        id: 1,
        reason: CloseReason::MaxUses,
    }));
    assert_eq!(pool.metrics().connections_recycled, 1);
}

#[tokio::test(start_paused = true)]
async fn test_connection_recycled_after_max_lifetime() {
    let mock = MockLifecycle::new();
    let pool = builder(&mock)
        .min_connections(1)
        .max_connections(2)
        .max_lifetime(Duration::from_secs(60))
        .build()
        .await
        .unwrap();

    let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;
    pool.release(conn);

    let status = pool.status();
    assert_eq!(status.total, 0);
    assert_eq!(status.available, 0);
    assert_eq!(pool.metrics().connections_recycled, 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_connections_above_min_are_evicted() {
    let mock = MockLifecycle::new();
    let pool = builder(&mock)
        .min_connections(1)
        .max_connections(3)
        .idle_timeout(Duration::from_secs(30))
        .reaper_interval(Duration::from_secs(5))
        .build()
        .await
        .unwrap();

    let held: Vec<_> = [
        pool.acquire(Duration::from_secs(1)).await.unwrap(),
        pool.acquire(Duration::from_secs(1)).await.unwrap(),
        pool.acquire(Duration::from_secs(1)).await.unwrap(),
    ]
    .into();
    drop(held);
    assert_eq!(pool.status().available, 3);

    tokio::time::sleep(Duration::from_secs(36)).await;

    let status = pool.status();
    assert_eq!(status.total, 1);
    assert_eq!(status.available, 1);
    assert_eq!(pool.metrics().connections_closed, 2);
}

#[tokio::test(start_paused = true)]
async fn test_reaper_replenishes_to_min() {
    let mock = MockLifecycle::new();
    let pool = builder(&mock)
        .min_connections(2)
        .max_connections(4)
        .reaper_interval(Duration::from_secs(5))
        .build()
        .await
        .unwrap();
    assert_eq!(pool.status().total, 2);

    let mut conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
    conn.mark_broken();
    drop(conn);
    assert_eq!(pool.status().total, 1);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(pool.status().total, 2);
    assert_eq!(mock.connections_opened(), 3);
}

// =============================================================================
// Session reset
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_reset_runs_before_reuse() {
    let mock = MockLifecycle::new();
    let pool = pool_with(&mock, 1, 1).await.unwrap();

    let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_eq!(mock.resets(), 0);
    pool.release(conn);
    assert_eq!(mock.resets(), 0);

    let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_eq!(conn.metadata().id, 1);
    assert_eq!(mock.resets(), 1);
    assert_eq!(pool.metrics().resets_performed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_reset_discards_connection() {
    let mock = MockLifecycle::new();
    let pool = pool_with(&mock, 1, 1).await.unwrap();

    pool.release(pool.acquire(Duration::from_secs(1)).await.unwrap());
    mock.fail_resets(1);

    let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_eq!(conn.metadata().id, 2);
    assert_eq!(pool.metrics().resets_failed, 1);
    assert_eq!(pool.status().total, 1);
}

#[tokio::test(start_paused = true)]
async fn test_broken_connection_is_not_reused() {
    let mock = MockLifecycle::new();
    let pool = pool_with(&mock, 1, 1).await.unwrap();
    let mut events = pool.subscribe();

    let mut conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
    conn.mark_broken();
    pool.release(conn);

    assert_eq!(
        drain(&mut events),
        vec![PoolEvent::ConnectionClosed {
            id: 1,
            reason: CloseReason::Broken,
        }]
    );
    assert_eq!(pool.acquire(Duration::from_secs(1)).await.unwrap().metadata().id, 2);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_during_checkout_is_backend_error() {
    let mock = MockLifecycle::new();
    let pool = pool_with(&mock, 1, 2).await.unwrap();

    let _held = pool.acquire(Duration::from_secs(1)).await.unwrap();
    mock.fail_connects(1);

    let err = pool.acquire(Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, PoolError::Backend(_)));
    assert_eq!(pool.status().total, 1);

    assert!(pool.acquire(Duration::from_secs(1)).await.is_ok());
}
