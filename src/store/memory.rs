//! In-memory store implementations.
//!
//! Used by the test suite and by deployments running without Postgres/S3
//! credentials that still want a process-local persistent tier for smoke
//! testing.  Semantics mirror the real backends, including the atomicity of
//! the refresh-lock mutations (each runs under one mutex acquisition).

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{BlobStore, CacheRow, MetadataStore, StoreStats};

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryMetadataStore {
    rows: Mutex<HashMap<String, CacheRow>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get(&self, key: &str) -> Result<Option<CacheRow>> {
        Ok(self.rows.lock().await.get(key).cloned())
    }

    async fn upsert(&self, row: &CacheRow) -> Result<()> {
        self.rows
            .lock()
            .await
            .insert(row.key.clone(), row.clone());
        Ok(())
    }

    async fn touch(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(row) = self.rows.lock().await.get_mut(key) {
            row.last_accessed_at = at;
        }
        Ok(())
    }

    async fn try_acquire_refresh(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut rows = self.rows.lock().await;
        let Some(row) = rows.get_mut(key) else {
            return Ok(false);
        };
        let backoff_clear = row.next_refresh_at.is_none_or(|at| at <= now);
        if row.refreshing || !backoff_clear {
            return Ok(false);
        }
        row.refreshing = true;
        Ok(true)
    }

    async fn fail_refresh(
        &self,
        key: &str,
        now: DateTime<Utc>,
        backoff_base: Duration,
        backoff_cap: Duration,
    ) -> Result<()> {
        let mut rows = self.rows.lock().await;
        if let Some(row) = rows.get_mut(key) {
            let exp = backoff_base.as_secs().saturating_mul(
                1u64 << (row.refresh_failures.clamp(0, 16) as u32),
            );
            let delay = Duration::from_secs(exp.min(backoff_cap.as_secs()));
            row.refresh_failures += 1;
            row.next_refresh_at = Some(now + delay);
            row.refreshing = false;
        }
        Ok(())
    }

    async fn clear_refreshing(&self, key: &str) -> Result<()> {
        if let Some(row) = self.rows.lock().await.get_mut(key) {
            row.refreshing = false;
        }
        Ok(())
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<StoreStats> {
        let rows = self.rows.lock().await;
        let total = rows.len() as i64;
        let fresh = rows
            .values()
            .filter(|r| now < r.soft_expires_at && now < r.hard_expires_at)
            .count() as i64;
        let inlined = rows.values().filter(|r| r.inline_bytes.is_some()).count() as i64;
        Ok(StoreStats {
            total,
            fresh,
            inlined,
        })
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|_, r| now < r.hard_expires_at);
        Ok((before - rows.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Blobs
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, path: &str, bytes: &[u8], _content_type: &str) -> Result<()> {
        self.blobs
            .lock()
            .await
            .insert(path.to_string(), Bytes::copy_from_slice(bytes));
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        self.blobs
            .lock()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("blob not found: {path}"))
    }
}
