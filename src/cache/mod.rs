//! Request coordination: the in-process orchestrator that sequences the
//! memory cache, the in-flight map, the persistent store, and the upstream
//! fetcher for every thumbnail request.
//!
//! [`CacheService`] is an injected value constructed once at startup (and
//! per-test); it owns all mutable in-process state.  Its single entry point
//! never returns an error for a parseable URL: every failure collapses into
//! a placeholder [`ThumbResult`] carrying a diagnostic reason.

pub mod inflight;
pub mod memory;
pub mod refresh;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::fetch::Fetcher;
use crate::metrics::{MetricsRegistry, RequestOutcome};
use crate::store::PersistentCache;
use crate::validate::{self, CanonicalUrl};

use inflight::{Flight, InflightMap};
use memory::{MemoryCache, MemoryEntry};

/// Fixed 1x1 SVG served whenever real bytes are unavailable.
pub const PLACEHOLDER_SVG: &[u8] =
    br#"<svg xmlns="http://www.w3.org/2000/svg" width="1" height="1"/>"#;
pub const PLACEHOLDER_CONTENT_TYPE: &str = "image/svg+xml";

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Which in-process cache tier answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Hit,
    Miss,
}

impl CacheTier {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheTier::Hit => "HIT",
            CacheTier::Miss => "MISS",
        }
    }
}

/// Persistent-tier outcome for the `x-thumb-store` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Hit served from inline bytes in the metadata row.
    InlineHit,
    /// Hit served from the blob store.
    Hit,
    /// Miss followed by a successful write-through.
    MissWrite,
    /// Miss where the write-through failed or the tier is disabled.
    MissWriteFailed,
}

impl StoreOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreOutcome::InlineHit => "L1",
            StoreOutcome::Hit => "HIT",
            StoreOutcome::MissWrite => "MISS_WRITE",
            StoreOutcome::MissWriteFailed => "MISS_WRITE_FAILED",
        }
    }
}

/// Everything a response needs: body bytes plus diagnostic metadata.
/// Cloneable so the in-flight map can fan one result out to all waiters.
#[derive(Debug, Clone)]
pub struct ThumbResult {
    pub body: Bytes,
    pub content_type: String,
    pub placeholder: bool,
    pub cache: CacheTier,
    pub store: Option<StoreOutcome>,
    pub reason: Option<&'static str>,
    pub attempts: u32,
    pub host: Option<String>,
    pub allowed: bool,
    pub stale: bool,
    pub refresh_spawned: bool,
}

impl ThumbResult {
    fn placeholder(reason: &'static str, allowed: bool, attempts: u32, host: Option<String>) -> Self {
        Self {
            body: Bytes::from_static(PLACEHOLDER_SVG),
            content_type: PLACEHOLDER_CONTENT_TYPE.to_string(),
            placeholder: true,
            cache: CacheTier::Miss,
            store: None,
            reason: Some(reason),
            attempts,
            host,
            allowed,
            stale: false,
            refresh_spawned: false,
        }
    }
}

/// The request URL did not parse as an absolute URL.  The only error the
/// coordinator surfaces; it maps to HTTP 400.
#[derive(Debug)]
pub struct InvalidUrl;

// ---------------------------------------------------------------------------
// CacheService
// ---------------------------------------------------------------------------

pub struct CacheService {
    memory: Mutex<MemoryCache>,
    inflight: InflightMap,
    store: Option<Arc<PersistentCache>>,
    fetcher: Fetcher,
    metrics: MetricsRegistry,
}

impl CacheService {
    pub fn new(
        config: &Config,
        store: Option<Arc<PersistentCache>>,
        fetcher: Fetcher,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            memory: Mutex::new(MemoryCache::new(
                config.memory_cache.capacity,
                Duration::from_secs(config.memory_cache.ttl_secs),
            )),
            inflight: InflightMap::new(),
            store,
            fetcher,
            metrics,
        }
    }

    pub fn persistent(&self) -> Option<&Arc<PersistentCache>> {
        self.store.as_ref()
    }

    /// Size, capacity, and TTL of the memory tier, for the admin endpoint.
    pub fn memory_stats(&self) -> (usize, usize, Duration) {
        let memory = self.lock_memory();
        (memory.len(), memory.capacity(), memory.ttl())
    }

    /// Clear the memory tier; returns the number of entries dropped.
    pub fn clear_memory(&self) -> usize {
        let n = self.lock_memory().clear();
        self.metrics.memory_entries.set(0);
        n
    }

    /// The map stays structurally valid through any panic, so a poisoned
    /// lock is recovered rather than propagated to later requests.
    fn lock_memory(&self) -> std::sync::MutexGuard<'_, MemoryCache> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serve one thumbnail request.
    ///
    /// Lookup order: memory cache, in-flight join, persistent store,
    /// upstream fetch.  Only an unparseable URL is an error; every other
    /// failure is absorbed into a placeholder result.
    pub async fn get_thumbnail(&self, raw_url: &str) -> Result<ThumbResult, InvalidUrl> {
        let canon = validate::canonicalize(raw_url).ok_or(InvalidUrl)?;

        // Memory tier; the lock is dropped before any await point.
        {
            let mut memory = self.lock_memory();
            if let Some(entry) = memory.get(&canon.key) {
                debug!(key = %canon.key, status = entry.status, "memory cache hit");
                self.metrics.record_outcome(RequestOutcome::MemoryHit);
                self.metrics.memory_entries.set(memory.len() as i64);
                return Ok(ThumbResult {
                    body: entry.bytes,
                    content_type: entry.content_type,
                    placeholder: false,
                    cache: CacheTier::Hit,
                    store: None,
                    reason: None,
                    attempts: 0,
                    host: canon.url.host_str().map(str::to_string),
                    allowed: true,
                    stale: false,
                    refresh_spawned: false,
                });
            }
        }

        match self.inflight.join_or_own(&canon.canonical) {
            Flight::Joined(rx) => {
                self.metrics.inflight_joins.inc();
                debug!(url = %canon.canonical, "joined in-flight fetch");
                match inflight::await_result(rx).await {
                    Some(result) => Ok(result),
                    // Owner vanished without publishing; never an error to
                    // the image tag.
                    None => Ok(ThumbResult::placeholder(
                        "internal_error",
                        true,
                        0,
                        canon.url.host_str().map(str::to_string),
                    )),
                }
            }
            Flight::Owner(owner) => {
                let result = self.fetch_uncached(&canon).await;
                owner.publish(result.clone());
                Ok(result)
            }
        }
    }

    /// Persistent lookup, then validate + fetch + write-through.  Infallible
    /// by construction: all failures produce placeholder results.
    async fn fetch_uncached(&self, canon: &CanonicalUrl) -> ThumbResult {
        let host = canon.url.host_str().map(str::to_string);

        // Persistent tier.
        if let Some(store) = &self.store {
            match store.read(&canon.key, Utc::now()).await {
                Ok(Some(hit)) => {
                    self.insert_memory(canon, hit.row.content_type.clone(), hit.bytes.clone());
                    let refresh_spawned = if hit.stale {
                        refresh::spawn_refresh(
                            Arc::clone(store),
                            self.fetcher.clone(),
                            canon.clone(),
                            self.metrics.clone(),
                        );
                        true
                    } else {
                        false
                    };
                    self.metrics.record_outcome(RequestOutcome::StoreHit);
                    return ThumbResult {
                        body: hit.bytes,
                        content_type: hit.row.content_type,
                        placeholder: false,
                        cache: CacheTier::Miss,
                        store: Some(if hit.inline {
                            StoreOutcome::InlineHit
                        } else {
                            StoreOutcome::Hit
                        }),
                        reason: None,
                        attempts: 0,
                        host,
                        allowed: true,
                        stale: hit.stale,
                        refresh_spawned,
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    self.metrics.store_read_errors.inc();
                    warn!(key = %canon.key, error = %e, "persistent read failed, falling through");
                }
            }
        }

        // Allowlist, then upstream.
        if let Err(reason) = self.fetcher.policy().check(&canon.url) {
            self.metrics.record_outcome(RequestOutcome::Placeholder);
            return ThumbResult::placeholder(reason.as_str(), false, 0, host);
        }

        match self.fetcher.fetch(canon).await {
            Ok(image) => {
                self.metrics
                    .upstream_attempts
                    .inc_by(u64::from(image.attempts));

                let store_outcome = match &self.store {
                    Some(store) => {
                        match store
                            .write(&canon.key, &canon.canonical, &image, Utc::now())
                            .await
                        {
                            Ok(()) => StoreOutcome::MissWrite,
                            Err(e) => {
                                self.metrics.store_write_errors.inc();
                                warn!(key = %canon.key, error = %e, "write-through failed, serving bytes anyway");
                                StoreOutcome::MissWriteFailed
                            }
                        }
                    }
                    None => StoreOutcome::MissWriteFailed,
                };

                self.insert_memory(canon, image.content_type.clone(), image.bytes.clone());
                self.metrics.record_outcome(RequestOutcome::Fetched);
                ThumbResult {
                    body: image.bytes,
                    content_type: image.content_type,
                    placeholder: false,
                    cache: CacheTier::Miss,
                    store: Some(store_outcome),
                    reason: None,
                    attempts: image.attempts,
                    host: Some(image.final_host),
                    allowed: true,
                    stale: false,
                    refresh_spawned: false,
                }
            }
            Err(e) => {
                self.metrics
                    .upstream_attempts
                    .inc_by(u64::from(e.attempts()));
                self.metrics.upstream_failures.inc();
                self.metrics.record_outcome(RequestOutcome::Placeholder);
                debug!(url = %canon.canonical, error = %e, "upstream fetch failed");
                ThumbResult::placeholder(e.reason_code(), !e.is_denied(), e.attempts(), host)
            }
        }
    }

    fn insert_memory(&self, canon: &CanonicalUrl, content_type: String, bytes: Bytes) {
        let mut memory = self.lock_memory();
        memory.insert(
            canon.key.clone(),
            MemoryEntry {
                inserted_at: Instant::now(),
                status: 200,
                content_type,
                bytes,
            },
        );
        self.metrics.memory_entries.set(memory.len() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AllowlistConfig, Config};
    use crate::store::memory::{MemoryBlobStore, MemoryMetadataStore};
    use crate::store::{MetadataStore, PersistentPolicy};
    use crate::validate::ValidationPolicy;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service(config: Config, with_store: bool) -> Arc<CacheService> {
        let allowlist = AllowlistConfig {
            cdn_suffixes: vec!["127.0.0.1".to_string()],
            allow_private_hosts: true,
            ..AllowlistConfig::default()
        };
        let fetcher = Fetcher::new(
            reqwest::Client::new(),
            Arc::new(ValidationPolicy::new(&allowlist)),
            config.upstream.clone(),
        );
        let store = with_store.then(|| {
            Arc::new(PersistentCache::new(
                Arc::new(MemoryMetadataStore::new()),
                Arc::new(MemoryBlobStore::new()),
                PersistentPolicy::from_config(&config.persistent),
            ))
        });
        Arc::new(CacheService::new(
            &config,
            store,
            fetcher,
            MetricsRegistry::new(),
        ))
    }

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.upstream.max_attempts = 1;
        config.upstream.timeout_ms = 2_000;
        config
    }

    #[tokio::test]
    async fn single_flight_coalesces_concurrent_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/img.jpg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(b"payload".to_vec())
                    .set_delay(Duration::from_millis(150)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let service = service(fast_config(), false);
        let url = format!("{}/img.jpg?token=a", server.uri());

        let mut handles = Vec::new();
        for i in 0..8 {
            let service = Arc::clone(&service);
            // Rotating query tokens must still coalesce to one fetch.
            let url = format!("{}/img.jpg?token={i}", server.uri());
            handles.push(tokio::spawn(async move {
                service.get_thumbnail(&url).await.unwrap()
            }));
        }
        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }
        assert!(results.iter().all(|r| r.body.as_ref() == b"payload"));

        // And the next request is a memory hit.
        let after = service.get_thumbnail(&url).await.unwrap();
        assert_eq!(after.cache, CacheTier::Hit);
    }

    #[tokio::test]
    async fn denied_url_yields_placeholder_not_error() {
        let service = service(fast_config(), false);
        let result = service
            .get_thumbnail("https://evil.com/steal.jpg")
            .await
            .unwrap();
        assert!(result.placeholder);
        assert!(!result.allowed);
        assert_eq!(result.reason, Some("not_allowlisted"));
        assert_eq!(result.body.as_ref(), PLACEHOLDER_SVG);
    }

    #[tokio::test]
    async fn unparseable_url_is_the_only_error() {
        let service = service(fast_config(), false);
        assert!(service.get_thumbnail("not a url").await.is_err());
    }

    #[tokio::test]
    async fn hostless_url_yields_bad_protocol_placeholder() {
        let service = service(fast_config(), false);
        let result = service
            .get_thumbnail("mailto:user@example.com")
            .await
            .unwrap();
        assert!(result.placeholder);
        assert!(!result.allowed);
        assert_eq!(result.reason, Some("bad_protocol"));
    }

    #[tokio::test]
    async fn stale_store_hit_served_immediately_with_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/img.jpg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(b"fresh".to_vec()),
            )
            .mount(&server)
            .await;

        let mut config = fast_config();
        config.persistent.soft_ttl_secs = 1;
        config.persistent.hard_ttl_secs = 3_600;
        let service = service(config, true);
        let url = format!("{}/img.jpg", server.uri());

        // Seed a stale row by writing with a backdated timestamp.
        let canon = crate::validate::canonicalize(&url).unwrap();
        let image = crate::fetch::FetchedImage {
            bytes: Bytes::from_static(b"stale-bytes"),
            content_type: "image/jpeg".to_string(),
            status: 200,
            attempts: 1,
            final_host: "127.0.0.1".to_string(),
        };
        let store = Arc::clone(service.persistent().unwrap());
        store
            .write(
                &canon.key,
                &canon.canonical,
                &image,
                Utc::now() - Duration::from_secs(10),
            )
            .await
            .unwrap();

        let result = service.get_thumbnail(&url).await.unwrap();
        assert!(result.stale);
        assert!(result.refresh_spawned);
        // Served the stale bytes without waiting for the refresh.
        assert_eq!(result.body.as_ref(), b"stale-bytes");

        // The detached refresh eventually replaces the stored bytes.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let row = store.metadata().get(&canon.key).await.unwrap().unwrap();
            if row.inline_bytes.as_deref() == Some(b"fresh".as_ref()) && !row.refreshing {
                return;
            }
        }
        panic!("background refresh did not land");
    }

    #[tokio::test]
    async fn hard_expired_row_forces_refetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/img.jpg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(b"refetched".to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut config = fast_config();
        config.persistent.soft_ttl_secs = 1;
        config.persistent.hard_ttl_secs = 2;
        let service = service(config, true);
        let url = format!("{}/img.jpg", server.uri());

        let canon = crate::validate::canonicalize(&url).unwrap();
        let image = crate::fetch::FetchedImage {
            bytes: Bytes::from_static(b"ancient"),
            content_type: "image/jpeg".to_string(),
            status: 200,
            attempts: 1,
            final_host: "127.0.0.1".to_string(),
        };
        let store = Arc::clone(service.persistent().unwrap());
        store
            .write(
                &canon.key,
                &canon.canonical,
                &image,
                Utc::now() - Duration::from_secs(60),
            )
            .await
            .unwrap();

        let result = service.get_thumbnail(&url).await.unwrap();
        assert_eq!(result.body.as_ref(), b"refetched");
        assert_eq!(result.store, Some(StoreOutcome::MissWrite));
    }

    #[tokio::test]
    async fn poisoned_memory_lock_recovers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/img.jpg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(b"payload".to_vec()),
            )
            .mount(&server)
            .await;

        let service = service(fast_config(), false);
        let url = format!("{}/img.jpg", server.uri());
        service.get_thumbnail(&url).await.unwrap();

        // Panic while holding the memory lock, poisoning it.
        let poisoner = Arc::clone(&service);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.memory.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        // Requests and admin calls keep working on the recovered lock.
        let result = service.get_thumbnail(&url).await.unwrap();
        assert_eq!(result.cache, CacheTier::Hit);
        assert_eq!(service.memory_stats().0, 1);
        assert_eq!(service.clear_memory(), 1);
    }

    #[tokio::test]
    async fn disabled_store_reports_write_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/img.jpg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(b"x".to_vec()),
            )
            .mount(&server)
            .await;

        let service = service(fast_config(), false);
        let result = service
            .get_thumbnail(&format!("{}/img.jpg", server.uri()))
            .await
            .unwrap();
        assert!(!result.placeholder);
        assert_eq!(result.store, Some(StoreOutcome::MissWriteFailed));
    }
}
