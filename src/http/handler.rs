//! Main axum router and the thumbnail request handler.
//!
//! Routes:
//! - `GET    /thumbnail?url=…&debugThumb=0|1` - cached image bytes or placeholder
//! - `GET    /thumbnail/admin`                - cache stats (secret-gated)
//! - `DELETE /thumbnail/admin`                - purge both tiers (secret-gated)
//! - `GET    /healthz`                        - health check
//! - `GET    /metrics`                        - Prometheus metrics
//!
//! The thumbnail endpoint is consumed by `<img>` tags, so it answers 200
//! with placeholder bytes on every failure except a missing/unparseable
//! `url` parameter; diagnostics travel in `x-thumb-*` response headers.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, instrument};

use super::AppState;
use crate::cache::{ThumbResult, PLACEHOLDER_CONTENT_TYPE, PLACEHOLDER_SVG};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/thumbnail", get(handle_thumbnail))
        .route(
            "/thumbnail/admin",
            get(super::admin::handle_stats).delete(super::admin::handle_purge),
        )
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Thumbnail endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ThumbQuery {
    url: Option<String>,
    #[serde(rename = "debugThumb")]
    debug_thumb: Option<String>,
}

/// `GET /thumbnail?url=<encoded URL>`
#[instrument(skip(state, query))]
async fn handle_thumbnail(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ThumbQuery>,
) -> Response {
    let Some(raw_url) = query.url.as_deref().filter(|u| !u.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing url parameter" })),
        )
            .into_response();
    };

    if query.debug_thumb.as_deref() == Some("1") {
        return placeholder_response("debug", true);
    }

    // The lookup runs in its own task so that a panic anywhere inside it
    // still answers the image tag with a placeholder, never an aborted
    // response.
    let cache = Arc::clone(&state.cache);
    let raw_url = raw_url.to_string();
    match tokio::spawn(async move { cache.get_thumbnail(&raw_url).await }).await {
        Ok(Ok(result)) => render_thumb(&result),
        Ok(Err(_)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "unparseable url parameter" })),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "thumbnail lookup task failed");
            placeholder_response("internal_error", true)
        }
    }
}

/// Build the always-200 image response with its diagnostic header set.
fn render_thumb(result: &ThumbResult) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header_value(&result.content_type, "application/octet-stream"),
    );
    // The proxy owns caching; browsers must not layer their own on top.
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(
        HeaderName::from_static("x-thumb-cache"),
        HeaderValue::from_static(result.cache.as_str()),
    );
    if let Some(store) = result.store {
        headers.insert(
            HeaderName::from_static("x-thumb-store"),
            HeaderValue::from_static(store.as_str()),
        );
    }
    headers.insert(
        HeaderName::from_static("x-thumb-attempts"),
        header_value(&result.attempts.to_string(), "0"),
    );
    if let Some(host) = &result.host {
        headers.insert(HeaderName::from_static("x-thumb-host"), header_value(host, ""));
    }
    headers.insert(
        HeaderName::from_static("x-thumb-allowed"),
        HeaderValue::from_static(if result.allowed { "1" } else { "0" }),
    );
    if let Some(reason) = result.reason {
        headers.insert(
            HeaderName::from_static("x-thumb-reason"),
            HeaderValue::from_static(reason),
        );
    }
    if result.stale {
        headers.insert(
            HeaderName::from_static("x-thumb-stale"),
            HeaderValue::from_static("1"),
        );
    }
    if result.refresh_spawned {
        headers.insert(
            HeaderName::from_static("x-thumb-refresh"),
            HeaderValue::from_static("1"),
        );
    }

    (StatusCode::OK, headers, result.body.clone()).into_response()
}

/// Placeholder response used by paths that never reach the coordinator.
fn placeholder_response(reason: &'static str, allowed: bool) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(PLACEHOLDER_CONTENT_TYPE),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(
        HeaderName::from_static("x-thumb-cache"),
        HeaderValue::from_static("MISS"),
    );
    headers.insert(
        HeaderName::from_static("x-thumb-reason"),
        HeaderValue::from_static(reason),
    );
    headers.insert(
        HeaderName::from_static("x-thumb-allowed"),
        HeaderValue::from_static(if allowed { "1" } else { "0" }),
    );
    (StatusCode::OK, headers, PLACEHOLDER_SVG).into_response()
}

/// Header values come from upstream responses and config; fall back rather
/// than panic on non-ASCII input.
fn header_value(value: &str, fallback: &'static str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static(fallback))
}

// ---------------------------------------------------------------------------
// Health and metrics
// ---------------------------------------------------------------------------

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "persistent_cache": state.cache.persistent().is_some(),
    }))
    .into_response()
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Response {
    let mut buf = String::new();
    match prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry) {
        Ok(()) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            buf,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
