//! Ledger and transactions on `sqlx` PostgreSQL connections.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Executor;
use sqlx::postgres::PgConnection;

use crate::ledger::{MigrationRecord, MigrationStatus, MigrationTarget};

#[async_trait]
impl MigrationTarget for PgConnection {
    type Error = sqlx::Error;

    async fn ensure_ledger(&mut self, table: &str) -> Result<(), sqlx::Error> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                name TEXT PRIMARY KEY,
                checksum TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                status TEXT NOT NULL DEFAULT 'applied'
            )"
        );
        Executor::execute(&mut *self, sql.as_str()).await?;
        Ok(())
    }

    async fn applied(&mut self, table: &str) -> Result<Vec<MigrationRecord>, sqlx::Error> {
        let sql = format!("SELECT name, checksum, applied_at, status FROM {table} ORDER BY name");
        let rows: Vec<(String, String, DateTime<Utc>, String)> =
            sqlx::query_as(&sql).fetch_all(&mut *self).await?;

        rows.into_iter()
            .map(|(name, checksum, applied_at, status)| {
                let status = status
                    .parse::<MigrationStatus>()
                    .map_err(|e| sqlx::Error::ColumnDecode {
                        index: "status".to_string(),
                        source: e.into(),
                    })?;
                Ok(MigrationRecord {
                    name,
                    checksum,
                    applied_at,
                    status,
                })
            })
            .collect()
    }

    async fn begin(&mut self) -> Result<(), sqlx::Error> {
        Executor::execute(&mut *self, "BEGIN").await?;
        Ok(())
    }

    // A bare `&str` carries no arguments, so it goes over the simple query
    // protocol and may hold several statements.
    async fn execute(&mut self, sql: &str) -> Result<(), sqlx::Error> {
        Executor::execute(&mut *self, sql).await?;
        Ok(())
    }

    async fn append(&mut self, table: &str, record: &MigrationRecord) -> Result<(), sqlx::Error> {
        let sql = format!(
            "INSERT INTO {table} (name, checksum, applied_at, status)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (name) DO UPDATE
             SET checksum = EXCLUDED.checksum,
                 applied_at = EXCLUDED.applied_at,
                 status = EXCLUDED.status"
        );
        sqlx::query(&sql)
            .bind(&record.name)
            .bind(&record.checksum)
            .bind(record.applied_at)
            .bind(record.status.as_str())
            .execute(&mut *self)
            .await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), sqlx::Error> {
        Executor::execute(&mut *self, "COMMIT").await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), sqlx::Error> {
        Executor::execute(&mut *self, "ROLLBACK").await?;
        Ok(())
    }
}
