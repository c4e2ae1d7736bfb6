//! Durable two-part cache storage: blob bytes in an object store, metadata
//! (TTLs, refresh lock state, failure counters) in a relational store.
//!
//! Access goes through the [`MetadataStore`] and [`BlobStore`] traits so the
//! coordinator and the test suite can swap Postgres/S3 for the in-memory
//! implementations.  [`PersistentCache`] layers the read/write policy on
//! top: hard-expired rows read as misses, small payloads are inlined into
//! the metadata row, reads touch `last_accessed_at` without blocking, and a
//! failed write never fails a request whose bytes were already fetched.

pub mod memory;
pub mod postgres;
pub mod s3;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::fetch::FetchedImage;

// ---------------------------------------------------------------------------
// Row and stats types
// ---------------------------------------------------------------------------

/// One metadata row per cache key, shared across all proxy processes.
#[derive(Debug, Clone)]
pub struct CacheRow {
    pub key: String,
    pub canonical_url: String,
    /// Blob store path, `<key>.bin`.
    pub storage_path: String,
    pub content_type: String,
    pub byte_size: i64,
    /// Small payloads stored directly in the row, avoiding a blob round-trip.
    pub inline_bytes: Option<Vec<u8>>,
    /// Past this instant the entry is stale but still servable.
    pub soft_expires_at: DateTime<Utc>,
    /// Past this instant the entry must never be served.
    pub hard_expires_at: DateTime<Utc>,
    /// Cross-process refresh lock flag.
    pub refreshing: bool,
    pub refresh_failures: i32,
    /// Earliest instant another refresh may be attempted after failures.
    pub next_refresh_at: Option<DateTime<Utc>>,
    pub last_accessed_at: DateTime<Utc>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Best-effort row counts for the admin stats endpoint.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct StoreStats {
    pub total: i64,
    pub fresh: i64,
    pub inlined: i64,
}

// ---------------------------------------------------------------------------
// Store traits
// ---------------------------------------------------------------------------

/// Relational metadata store. All mutations that participate in the refresh
/// lock protocol must be single atomic statements.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheRow>>;

    /// Insert or replace a row.  A successful write-through resets
    /// `refreshing`, `refresh_failures`, and `next_refresh_at` in the same
    /// statement, which is what completes a refresh atomically.
    async fn upsert(&self, row: &CacheRow) -> Result<()>;

    /// Update `last_accessed_at`; callers treat failure as non-fatal.
    async fn touch(&self, key: &str, at: DateTime<Utc>) -> Result<()>;

    /// Conditional lock acquire: set `refreshing = true` only where it is
    /// currently false and no failure backoff is pending.  Returns `false`
    /// (zero rows updated) when another process holds the lock — that is the
    /// expected contention outcome, not an error.
    async fn try_acquire_refresh(&self, key: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Record a failed refresh: increment the failure counter, schedule
    /// `next_refresh_at = now + min(base * 2^failures, cap)`, and clear
    /// `refreshing`, all in one atomic statement.
    async fn fail_refresh(
        &self,
        key: &str,
        now: DateTime<Utc>,
        backoff_base: Duration,
        backoff_cap: Duration,
    ) -> Result<()>;

    /// Unconditionally clear `refreshing`.
    async fn clear_refreshing(&self, key: &str) -> Result<()>;

    async fn stats(&self, now: DateTime<Utc>) -> Result<StoreStats>;

    /// Delete rows past their hard expiry; returns the count removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Object store holding one blob per cache key.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<()>;
    async fn get(&self, path: &str) -> Result<Bytes>;
}

// ---------------------------------------------------------------------------
// PersistentCache
// ---------------------------------------------------------------------------

/// TTL and inlining policy for the persistent tier.
#[derive(Debug, Clone)]
pub struct PersistentPolicy {
    pub soft_ttl: Duration,
    pub hard_ttl: Duration,
    pub inline_max_bytes: usize,
    pub refresh_backoff_base: Duration,
    pub refresh_backoff_cap: Duration,
}

impl PersistentPolicy {
    pub fn from_config(config: &crate::config::PersistentConfig) -> Self {
        Self {
            soft_ttl: Duration::from_secs(config.soft_ttl_secs),
            hard_ttl: Duration::from_secs(config.hard_ttl_secs),
            inline_max_bytes: config.inline_max_bytes,
            refresh_backoff_base: Duration::from_secs(config.refresh_backoff_base_secs),
            refresh_backoff_cap: Duration::from_secs(config.refresh_backoff_cap_secs),
        }
    }
}

/// A persistent-tier hit: the row, its bytes, and how they were obtained.
#[derive(Debug, Clone)]
pub struct StoreHit {
    pub row: CacheRow,
    pub bytes: Bytes,
    /// Bytes came from the metadata row rather than the blob store.
    pub inline: bool,
    /// Past the soft TTL: servable, but a background refresh is due.
    pub stale: bool,
}

/// The durable cache tier: metadata rows plus blob objects.
pub struct PersistentCache {
    meta: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    policy: PersistentPolicy,
}

impl PersistentCache {
    pub fn new(
        meta: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        policy: PersistentPolicy,
    ) -> Self {
        Self { meta, blobs, policy }
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.meta
    }

    pub fn policy(&self) -> &PersistentPolicy {
        &self.policy
    }

    /// Look up a key; hard-expired rows are treated as absent.
    ///
    /// A hit fires a non-blocking `last_accessed_at` touch and returns bytes
    /// from the inline column when present, else from the blob store.  A
    /// missing blob is an error here so callers can log it as an explicit
    /// store-read failure and fall through to upstream.
    pub async fn read(&self, key: &str, now: DateTime<Utc>) -> Result<Option<StoreHit>> {
        let Some(row) = self.meta.get(key).await? else {
            return Ok(None);
        };
        if now >= row.hard_expires_at {
            debug!(%key, "persistent row past hard expiry, treating as miss");
            return Ok(None);
        }

        {
            let meta = Arc::clone(&self.meta);
            let key = key.to_string();
            tokio::spawn(async move {
                if let Err(e) = meta.touch(&key, now).await {
                    debug!(%key, error = %e, "last-accessed touch failed");
                }
            });
        }

        let (bytes, inline) = match &row.inline_bytes {
            Some(b) => (Bytes::from(b.clone()), true),
            None => {
                let bytes = self
                    .blobs
                    .get(&row.storage_path)
                    .await
                    .with_context(|| format!("blob read failed for {}", row.storage_path))?;
                (bytes, false)
            }
        };

        let stale = now >= row.soft_expires_at;
        Ok(Some(StoreHit {
            row,
            bytes,
            inline,
            stale,
        }))
    }

    /// Write a fetched image through to both parts of the store: blob first,
    /// then the metadata upsert with fresh TTLs and cleared refresh state.
    pub async fn write(
        &self,
        key: &str,
        canonical_url: &str,
        image: &FetchedImage,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let storage_path = storage_path(key);
        self.blobs
            .put(&storage_path, &image.bytes, &image.content_type)
            .await
            .with_context(|| format!("blob upload failed for {storage_path}"))?;

        let inline_bytes = (image.bytes.len() <= self.policy.inline_max_bytes)
            .then(|| image.bytes.to_vec());

        let row = CacheRow {
            key: key.to_string(),
            canonical_url: canonical_url.to_string(),
            storage_path,
            content_type: image.content_type.clone(),
            byte_size: image.bytes.len() as i64,
            inline_bytes,
            soft_expires_at: now + self.policy.soft_ttl,
            hard_expires_at: now + self.policy.hard_ttl,
            refreshing: false,
            refresh_failures: 0,
            next_refresh_at: None,
            last_accessed_at: now,
            etag: None,
            last_modified: None,
        };
        self.meta
            .upsert(&row)
            .await
            .context("metadata upsert failed")
    }

    pub async fn stats(&self, now: DateTime<Utc>) -> Result<StoreStats> {
        self.meta.stats(now).await
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        self.meta.purge_expired(now).await
    }
}

/// Deterministic blob path for a cache key.
pub fn storage_path(key: &str) -> String {
    format!("{key}.bin")
}

#[cfg(test)]
mod tests {
    use super::memory::{MemoryBlobStore, MemoryMetadataStore};
    use super::*;
    use crate::fetch::FetchedImage;

    fn image(len: usize) -> FetchedImage {
        FetchedImage {
            bytes: Bytes::from(vec![0xAB; len]),
            content_type: "image/jpeg".to_string(),
            status: 200,
            attempts: 1,
            final_host: "scontent.cdninstagram.com".to_string(),
        }
    }

    fn cache(inline_max: usize) -> PersistentCache {
        PersistentCache::new(
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(MemoryBlobStore::new()),
            PersistentPolicy {
                soft_ttl: Duration::from_secs(60),
                hard_ttl: Duration::from_secs(120),
                inline_max_bytes: inline_max,
                refresh_backoff_base: Duration::from_secs(10),
                refresh_backoff_cap: Duration::from_secs(100),
            },
        )
    }

    #[tokio::test]
    async fn small_payload_is_inlined() {
        let cache = cache(1024);
        let now = Utc::now();
        cache.write("k1", "https://cdn/x.jpg", &image(100), now).await.unwrap();

        let hit = cache.read("k1", now).await.unwrap().unwrap();
        assert!(hit.inline);
        assert!(!hit.stale);
        assert_eq!(hit.bytes.len(), 100);
        assert_eq!(hit.row.inline_bytes.as_ref().unwrap().len(), 100);
    }

    #[tokio::test]
    async fn large_payload_comes_from_blob_store() {
        let cache = cache(64);
        let now = Utc::now();
        cache.write("k2", "https://cdn/y.jpg", &image(500), now).await.unwrap();

        let hit = cache.read("k2", now).await.unwrap().unwrap();
        assert!(!hit.inline);
        assert_eq!(hit.bytes.len(), 500);
        assert!(hit.row.inline_bytes.is_none());
    }

    #[tokio::test]
    async fn hard_expired_row_reads_as_miss() {
        let cache = cache(1024);
        let now = Utc::now();
        cache.write("k3", "https://cdn/z.jpg", &image(10), now).await.unwrap();

        let later = now + Duration::from_secs(121);
        assert!(cache.read("k3", later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn soft_expired_row_is_stale_but_served() {
        let cache = cache(1024);
        let now = Utc::now();
        cache.write("k4", "https://cdn/w.jpg", &image(10), now).await.unwrap();

        let later = now + Duration::from_secs(61);
        let hit = cache.read("k4", later).await.unwrap().is_some_and(|h| h.stale);
        assert!(hit);
    }

    #[tokio::test]
    async fn rewrite_resets_refresh_state() {
        let cache = cache(1024);
        let now = Utc::now();
        cache.write("k5", "https://cdn/v.jpg", &image(10), now).await.unwrap();
        assert!(cache.metadata().try_acquire_refresh("k5", now).await.unwrap());

        cache.write("k5", "https://cdn/v.jpg", &image(12), now).await.unwrap();
        let row = cache.metadata().get("k5").await.unwrap().unwrap();
        assert!(!row.refreshing);
        assert_eq!(row.refresh_failures, 0);
        assert!(row.next_refresh_at.is_none());
        assert_eq!(row.byte_size, 12);
    }
}
