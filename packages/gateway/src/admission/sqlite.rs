// ABOUTME: SQLite-backed CounterStore for deployments that share counters across restarts
// ABOUTME: Each increment is a single UPSERT ... RETURNING statement so no read-modify-write spans an await

use super::store::{CounterStore, Result, StoreError, WindowCount};
use crate::clock::to_chrono;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

pub struct SqliteCounterStore {
    pool: SqlitePool,
}

impl SqliteCounterStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `url` and run migrations
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // in-memory databases are per-connection
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(url = %url, "Counter store ready");

        Ok(Self::new(pool))
    }

    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    fn to_row(key: &str, count: i64, expires_at: i64) -> Result<WindowCount> {
        let count = u64::try_from(count).map_err(|_| StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("negative count {}", count),
        })?;
        let expires_at = Utc
            .timestamp_millis_opt(expires_at)
            .single()
            .ok_or_else(|| StoreError::Corrupt {
                key: key.to_string(),
                reason: format!("expiry {} out of range", expires_at),
            })?;
        Ok(WindowCount { count, expires_at })
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl CounterStore for SqliteCounterStore {
    async fn increment(
        &self,
        key: &str,
        amount: u64,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowCount> {
        let now_ms = now.timestamp_millis();
        let expires_ms = (now + to_chrono(ttl)).timestamp_millis();

        let (count, expires_at): (i64, i64) = sqlx::query_as(
            r#"
            INSERT INTO counters (key, count, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                count = CASE
                    WHEN counters.expires_at <= ?4 THEN excluded.count
                    ELSE counters.count + excluded.count
                END,
                expires_at = CASE
                    WHEN counters.expires_at <= ?4 THEN excluded.expires_at
                    ELSE counters.expires_at
                END
            RETURNING count, expires_at
            "#,
        )
        .bind(key)
        .bind(saturating_i64(amount))
        .bind(expires_ms)
        .bind(now_ms)
        .fetch_one(&self.pool)
        .await?;

        Self::to_row(key, count, expires_at)
    }

    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<WindowCount>> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT count, expires_at FROM counters WHERE key = ?1 AND expires_at > ?2",
        )
        .bind(key)
        .bind(now.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(count, expires_at)| Self::to_row(key, count, expires_at))
            .transpose()
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM counters WHERE expires_at <= ?1")
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
