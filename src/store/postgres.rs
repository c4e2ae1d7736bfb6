//! Postgres-backed metadata store.
//!
//! Every refresh-lock mutation is a single `UPDATE` statement so the
//! acquire/fail/complete steps are race-free without explicit transactions:
//! "zero rows updated" on acquire is how lock contention is reported.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, instrument};

use super::{CacheRow, MetadataStore, StoreStats};
use crate::config::PostgresConfig;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS thumb_cache (
    key              TEXT PRIMARY KEY,
    canonical_url    TEXT NOT NULL,
    storage_path     TEXT NOT NULL,
    content_type     TEXT NOT NULL,
    byte_size        BIGINT NOT NULL,
    inline_bytes     BYTEA,
    soft_expires_at  TIMESTAMPTZ NOT NULL,
    hard_expires_at  TIMESTAMPTZ NOT NULL,
    refreshing       BOOLEAN NOT NULL DEFAULT FALSE,
    refresh_failures INTEGER NOT NULL DEFAULT 0,
    next_refresh_at  TIMESTAMPTZ,
    last_accessed_at TIMESTAMPTZ NOT NULL,
    etag             TEXT,
    last_modified    TEXT
)
"#;

const SELECT_COLUMNS: &str = "key, canonical_url, storage_path, content_type, byte_size, \
     inline_bytes, soft_expires_at, hard_expires_at, refreshing, refresh_failures, \
     next_refresh_at, last_accessed_at, etag, last_modified";

pub struct PostgresMetadataStore {
    pool: PgPool,
}

impl PostgresMetadataStore {
    /// Connect and make sure the cache table exists.
    #[instrument(skip(url))]
    pub async fn connect(url: &str, config: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .context("failed to connect to metadata store")?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .context("failed to ensure thumb_cache schema")?;

        info!(pool_size = config.pool_size, "metadata store initialised");
        Ok(Self { pool })
    }
}

fn row_to_cache_row(row: &PgRow) -> CacheRow {
    CacheRow {
        key: row.get("key"),
        canonical_url: row.get("canonical_url"),
        storage_path: row.get("storage_path"),
        content_type: row.get("content_type"),
        byte_size: row.get("byte_size"),
        inline_bytes: row.get("inline_bytes"),
        soft_expires_at: row.get("soft_expires_at"),
        hard_expires_at: row.get("hard_expires_at"),
        refreshing: row.get("refreshing"),
        refresh_failures: row.get("refresh_failures"),
        next_refresh_at: row.get("next_refresh_at"),
        last_accessed_at: row.get("last_accessed_at"),
        etag: row.get("etag"),
        last_modified: row.get("last_modified"),
    }
}

#[async_trait]
impl MetadataStore for PostgresMetadataStore {
    async fn get(&self, key: &str) -> Result<Option<CacheRow>> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM thumb_cache WHERE key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .context("metadata select failed")?;
        Ok(row.as_ref().map(row_to_cache_row))
    }

    async fn upsert(&self, row: &CacheRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO thumb_cache (
                key, canonical_url, storage_path, content_type, byte_size,
                inline_bytes, soft_expires_at, hard_expires_at, refreshing,
                refresh_failures, next_refresh_at, last_accessed_at, etag, last_modified
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, FALSE, 0, NULL, $9, $10, $11)
            ON CONFLICT (key) DO UPDATE SET
                canonical_url    = EXCLUDED.canonical_url,
                storage_path     = EXCLUDED.storage_path,
                content_type     = EXCLUDED.content_type,
                byte_size        = EXCLUDED.byte_size,
                inline_bytes     = EXCLUDED.inline_bytes,
                soft_expires_at  = EXCLUDED.soft_expires_at,
                hard_expires_at  = EXCLUDED.hard_expires_at,
                refreshing       = FALSE,
                refresh_failures = 0,
                next_refresh_at  = NULL,
                last_accessed_at = EXCLUDED.last_accessed_at,
                etag             = EXCLUDED.etag,
                last_modified    = EXCLUDED.last_modified
            "#,
        )
        .bind(&row.key)
        .bind(&row.canonical_url)
        .bind(&row.storage_path)
        .bind(&row.content_type)
        .bind(row.byte_size)
        .bind(&row.inline_bytes)
        .bind(row.soft_expires_at)
        .bind(row.hard_expires_at)
        .bind(row.last_accessed_at)
        .bind(&row.etag)
        .bind(&row.last_modified)
        .execute(&self.pool)
        .await
        .context("metadata upsert failed")?;
        Ok(())
    }

    async fn touch(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE thumb_cache SET last_accessed_at = $2 WHERE key = $1")
            .bind(key)
            .bind(at)
            .execute(&self.pool)
            .await
            .context("last-accessed touch failed")?;
        Ok(())
    }

    async fn try_acquire_refresh(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE thumb_cache SET refreshing = TRUE
            WHERE key = $1
              AND refreshing = FALSE
              AND (next_refresh_at IS NULL OR next_refresh_at <= $2)
            "#,
        )
        .bind(key)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("refresh lock acquire failed")?;

        let acquired = result.rows_affected() == 1;
        debug!(%key, acquired, "try_acquire_refresh");
        Ok(acquired)
    }

    async fn fail_refresh(
        &self,
        key: &str,
        now: DateTime<Utc>,
        backoff_base: Duration,
        backoff_cap: Duration,
    ) -> Result<()> {
        // refresh_failures on the right-hand side is the pre-update value,
        // so the first failure schedules base * 2^0.
        sqlx::query(
            r#"
            UPDATE thumb_cache SET
                refreshing       = FALSE,
                refresh_failures = refresh_failures + 1,
                next_refresh_at  = $2 + make_interval(secs =>
                    LEAST($3 * POWER(2, refresh_failures), $4))
            WHERE key = $1
            "#,
        )
        .bind(key)
        .bind(now)
        .bind(backoff_base.as_secs_f64())
        .bind(backoff_cap.as_secs_f64())
        .execute(&self.pool)
        .await
        .context("refresh failure update failed")?;
        Ok(())
    }

    async fn clear_refreshing(&self, key: &str) -> Result<()> {
        sqlx::query("UPDATE thumb_cache SET refreshing = FALSE WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .context("clear refreshing failed")?;
        Ok(())
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<StoreStats> {
        let row: (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE soft_expires_at > $1 AND hard_expires_at > $1),
                COUNT(*) FILTER (WHERE inline_bytes IS NOT NULL)
            FROM thumb_cache
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("metadata stats query failed")?;
        Ok(StoreStats {
            total: row.0,
            fresh: row.1,
            inlined: row.2,
        })
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM thumb_cache WHERE hard_expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .context("metadata purge failed")?;
        Ok(result.rows_affected())
    }
}
