use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub outcome: RequestOutcome,
}

/// How a thumbnail request was ultimately served.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RequestOutcome {
    MemoryHit,
    StoreHit,
    Fetched,
    Placeholder,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the proxy.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,

    // -- requests --
    pub requests: Family<RequestLabels, Counter>,
    pub inflight_joins: Counter,

    // -- upstream --
    pub upstream_attempts: Counter,
    pub upstream_failures: Counter,

    // -- persistent store --
    pub store_read_errors: Counter,
    pub store_write_errors: Counter,

    // -- background refresh --
    pub refresh_started: Counter,
    pub refresh_skipped: Counter,
    pub refresh_failed: Counter,

    // -- gauges --
    pub memory_entries: Gauge,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests = Family::<RequestLabels, Counter>::default();
        registry.register(
            "thumbcache_requests",
            "Thumbnail requests by serving outcome",
            requests.clone(),
        );

        let inflight_joins = Counter::default();
        registry.register(
            "thumbcache_inflight_joins",
            "Requests that joined an already-running fetch",
            inflight_joins.clone(),
        );

        let upstream_attempts = Counter::default();
        registry.register(
            "thumbcache_upstream_attempts",
            "Individual upstream fetch attempts",
            upstream_attempts.clone(),
        );

        let upstream_failures = Counter::default();
        registry.register(
            "thumbcache_upstream_failures",
            "Upstream fetches that produced no usable image",
            upstream_failures.clone(),
        );

        let store_read_errors = Counter::default();
        registry.register(
            "thumbcache_store_read_errors",
            "Persistent cache read failures",
            store_read_errors.clone(),
        );

        let store_write_errors = Counter::default();
        registry.register(
            "thumbcache_store_write_errors",
            "Persistent cache write-through failures",
            store_write_errors.clone(),
        );

        let refresh_started = Counter::default();
        registry.register(
            "thumbcache_refresh_started",
            "Background refreshes started after acquiring the lock",
            refresh_started.clone(),
        );

        let refresh_skipped = Counter::default();
        registry.register(
            "thumbcache_refresh_skipped",
            "Background refreshes skipped because the lock was held",
            refresh_skipped.clone(),
        );

        let refresh_failed = Counter::default();
        registry.register(
            "thumbcache_refresh_failed",
            "Background refreshes that failed",
            refresh_failed.clone(),
        );

        let memory_entries = Gauge::default();
        registry.register(
            "thumbcache_memory_entries",
            "Entries currently held in the memory cache",
            memory_entries.clone(),
        );

        Self {
            registry: Arc::new(registry),
            requests,
            inflight_joins,
            upstream_attempts,
            upstream_failures,
            store_read_errors,
            store_write_errors,
            refresh_started,
            refresh_skipped,
            refresh_failed,
            memory_entries,
        }
    }

    pub fn record_outcome(&self, outcome: RequestOutcome) {
        self.requests.get_or_create(&RequestLabels { outcome }).inc();
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
