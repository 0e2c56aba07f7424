//! Migration runner against the in-memory ledger, plus the `keel` facade.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use keel_migrate::{
    Migration, MigrationError, MigrationRecord, MigrationRunner, MigrationSet, MigrationStatus,
    checksum,
};
use keel_testing::{MockError, MockLifecycle, pool_with};

fn five() -> MigrationSet {
    MigrationSet::from_migrations((1..=5).map(|n| {
        Migration::new(
            format!("000{n}_create_t{n}"),
            format!("CREATE TABLE t{n} (id BIGINT PRIMARY KEY)"),
        )
    }))
    .unwrap()
}

// =============================================================================
// Applying
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_second_run_is_a_noop() {
    let mock = MockLifecycle::new();
    let pool = pool_with(&mock, 1, 2).await.unwrap();
    let runner = MigrationRunner::new();

    let first = runner.run(&pool, &five()).await.unwrap();
    assert_eq!(first.applied.len(), 5);
    assert!(first.skipped.is_empty());
    assert!(first.applied.iter().all(MigrationRecord::is_applied));

    let second = runner.run(&pool, &five()).await.unwrap();
    assert!(second.is_noop());
    assert_eq!(second.skipped.len(), 5);

    let ledger = mock.ledger();
    assert_eq!(ledger.rows().len(), 5);
    assert_eq!(ledger.committed().len(), 5);
    assert_eq!(ledger.attempted().len(), 5);
    assert_eq!(ledger.tables(), ["keel_migrations".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_migrations_apply_in_name_order() {
    let mock = MockLifecycle::new();
    let pool = pool_with(&mock, 1, 2).await.unwrap();

    let set = MigrationSet::new()
        .with(Migration::new("0002_b", "CREATE TABLE b (id INT)"))
        .unwrap()
        .with(Migration::new("0001_a", "CREATE TABLE a (id INT)"))
        .unwrap();
    let report = MigrationRunner::new().run(&pool, &set).await.unwrap();

    let names: Vec<_> = report.applied.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["0001_a", "0002_b"]);
    assert_eq!(
        mock.ledger().committed(),
        ["CREATE TABLE a (id INT)", "CREATE TABLE b (id INT)"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_failure_stops_run_and_rolls_back_only_that_migration() {
    let mock = MockLifecycle::new();
    mock.fail_statements_containing("t3");
    let pool = pool_with(&mock, 1, 2).await.unwrap();

    let err = MigrationRunner::new().run(&pool, &five()).await.unwrap_err();
    match err {
        MigrationError::Failed { name, source } => {
            assert_eq!(name, "0003_create_t3");
            assert!(matches!(
                source.downcast_ref::<MockError>(),
                Some(MockError::Statement(_))
            ));
        }
        other => panic!("expected a failed migration, got {other:?}"),
    }

    let ledger = mock.ledger();
    assert_eq!(ledger.names(), ["0001_create_t1", "0002_create_t2"]);
    assert_eq!(ledger.committed().len(), 2);
    assert!(ledger.committed().iter().all(|sql| !sql.contains("t3")));
    assert_eq!(ledger.attempted().len(), 3);
    assert!(ledger
        .attempted()
        .iter()
        .all(|sql| !sql.contains("t4") && !sql.contains("t5")));

    let status = pool.status();
    assert_eq!(status.in_use, 0);
    let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert!(!conn.connection().await.unwrap().in_transaction());
}

#[tokio::test(start_paused = true)]
async fn test_rerun_after_fix_resumes_at_failed_migration() {
    let mock = MockLifecycle::new();
    mock.fail_statements_containing("t3");
    let pool = pool_with(&mock, 1, 2).await.unwrap();
    let runner = MigrationRunner::new();
    assert!(runner.run(&pool, &five()).await.is_err());

    let fixed = MigrationSet::from_migrations(five().iter().cloned().map(|m| {
        if m.name() == "0003_create_t3" {
            Migration::new(m.name(), "CREATE TABLE t_three (id BIGINT PRIMARY KEY)")
        } else {
            m
        }
    }))
    .unwrap();

    let report = runner.run(&pool, &fixed).await.unwrap();
    assert_eq!(report.skipped, ["0001_create_t1", "0002_create_t2"]);
    assert_eq!(report.applied.len(), 3);
    assert_eq!(mock.ledger().rows().len(), 5);
}

// =============================================================================
// Ledger state
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_checksum_drift_is_rejected_before_applying() {
    let mock = MockLifecycle::new();
    mock.insert_ledger_row(MigrationRecord::applied(
        "0001_create_t1",
        checksum("CREATE TABLE t1 (id INT)"),
    ));
    let pool = pool_with(&mock, 1, 2).await.unwrap();

    let err = MigrationRunner::new().run(&pool, &five()).await.unwrap_err();
    match err {
        MigrationError::ChecksumMismatch {
            name,
            recorded,
            current,
        } => {
            assert_eq!(name, "0001_create_t1");
            assert_eq!(recorded, checksum("CREATE TABLE t1 (id INT)"));
            assert_eq!(current, checksum("CREATE TABLE t1 (id BIGINT PRIMARY KEY)"));
        }
        other => panic!("expected checksum mismatch, got {other:?}"),
    }
    assert!(mock.ledger().attempted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_row_is_retried_and_overwritten() {
    let mock = MockLifecycle::new();
    let set = five();
    let first = set.get("0001_create_t1").unwrap();
    mock.insert_ledger_row(MigrationRecord {
        status: MigrationStatus::Failed,
        ..MigrationRecord::applied(first.name(), "stale")
    });
    let pool = pool_with(&mock, 1, 2).await.unwrap();

    let report = MigrationRunner::new().run(&pool, &set).await.unwrap();
    assert_eq!(report.applied.len(), 5);

    let rows = mock.ledger().rows();
    let row = rows.iter().find(|r| r.name == first.name()).unwrap();
    assert_eq!(row.status, MigrationStatus::Applied);
    assert_eq!(row.checksum, first.checksum());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_ledger_rows_are_ignored() {
    let mock = MockLifecycle::new();
    mock.insert_ledger_row(MigrationRecord::applied("0000_retired", checksum("SELECT 1")));
    let pool = pool_with(&mock, 1, 2).await.unwrap();

    let report = MigrationRunner::new().run(&pool, &five()).await.unwrap();
    assert_eq!(report.applied.len(), 5);
    assert_eq!(mock.ledger().rows().len(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_custom_ledger_table() {
    let mock = MockLifecycle::new();
    let pool = pool_with(&mock, 1, 2).await.unwrap();

    MigrationRunner::new()
        .table("schema_history")
        .run(&pool, &five())
        .await
        .unwrap();
    assert_eq!(mock.ledger().tables(), ["schema_history".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_table_name_is_rejected() {
    let mock = MockLifecycle::new();
    let pool = pool_with(&mock, 1, 2).await.unwrap();

    let err = MigrationRunner::new()
        .table("migrations; DROP TABLE users")
        .run(&pool, &five())
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::InvalidDefinition(_)));
    assert!(mock.ledger().tables().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_closed_pool_surfaces_pool_error() {
    let mock = MockLifecycle::new();
    let pool = pool_with(&mock, 1, 2).await.unwrap();
    pool.close().await;

    let err = MigrationRunner::new().run(&pool, &five()).await.unwrap_err();
    assert!(matches!(
        err,
        MigrationError::Pool(keel_pool::PoolError::PoolClosed)
    ));
}

// =============================================================================
// keel facade
// =============================================================================

fn facade_config() -> keel::DatabaseConfig {
    keel::DatabaseConfig::from_lookup(|key| {
        let value = match key {
            "DB_HOST" => "localhost",
            "DB_PORT" => "5432",
            "DB_NAME" => "keel",
            "DB_USER" => "keel",
            "DB_PASSWORD" => "secret",
            "DB_POOL_MAX" => "4",
            "DB_MIGRATIONS_TABLE" => "app_migrations",
            _ => return None,
        };
        Some(value.to_string())
    })
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_database_boot_migrate_and_shut_down() {
    let mock = MockLifecycle::new();
    let db = keel::Database::connect(facade_config(), mock.clone())
        .await
        .unwrap();
    assert!(db.is_healthy());

    let report = db.run_migrations(&five()).await.unwrap();
    assert_eq!(report.applied.len(), 5);
    assert_eq!(mock.ledger().tables(), ["app_migrations".to_string()]);

    let shutdown = db.begin_shutdown(keel::ShutdownSignal::Terminate).await;
    assert_eq!(shutdown.outcome, keel::ShutdownOutcome::Drained);

    let err = db.acquire(Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(
        err,
        keel::Error::Pool(keel::PoolError::PoolClosed)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_database_connect_gives_up_after_retries() {
    let mock = MockLifecycle::new();
    mock.fail_connects(u32::MAX);

    let err = keel::Database::connect(facade_config(), mock.clone())
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(
        err,
        keel::Error::Pool(keel::PoolError::Connection { attempts: 6, .. })
    ));
    assert_eq!(mock.connect_attempts().len(), 6);
}
