//! Caching proxy for third-party CDN thumbnails.
//!
//! The proxy fronts remote image CDNs for an analytics dashboard.  Incoming
//! requests pass through a URL allowlist, a bounded in-process memory cache,
//! an in-flight deduplication map, and a durable two-part store (blob bytes
//! in S3, metadata in Postgres) with stale-while-revalidate semantics.  The
//! image-facing endpoint never surfaces errors: every failure path collapses
//! into a 1x1 placeholder with diagnostic response headers.

pub mod cache;
pub mod config;
pub mod fetch;
pub mod http;
pub mod metrics;
pub mod store;
pub mod validate;
