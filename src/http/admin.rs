//! Admin surface over the two cache tiers: read-only stats and purge.
//!
//! Gated by the `x-admin-secret` header.  Persistent-store counting is
//! best-effort: when the metadata store is unreachable the corresponding
//! JSON fields degrade to `null` instead of failing the request.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument, warn};

use super::AppState;

const ADMIN_SECRET_HEADER: &str = "x-admin-secret";

/// Constant-shape secret check: absent configuration rejects everything.
fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(expected) = state.admin_secret.as_deref() else {
        return false;
    };
    headers
        .get(ADMIN_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|provided| provided == expected)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "unauthorized" })),
    )
        .into_response()
}

/// `GET /thumbnail/admin`
#[instrument(skip(state, headers))]
pub async fn handle_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    let (size, capacity, ttl) = state.cache.memory_stats();

    let persistent = match state.cache.persistent() {
        Some(store) => match store.stats(Utc::now()).await {
            Ok(stats) => json!({
                "enabled": true,
                "total": stats.total,
                "fresh": stats.fresh,
                "inlined": stats.inlined,
            }),
            Err(e) => {
                warn!(error = %e, "persistent stats unavailable");
                json!({
                    "enabled": true,
                    "total": null,
                    "fresh": null,
                    "inlined": null,
                })
            }
        },
        None => json!({ "enabled": false }),
    };

    Json(json!({
        "memory": {
            "size": size,
            "capacity": capacity,
            "ttl_secs": ttl.as_secs(),
        },
        "persistent": persistent,
    }))
    .into_response()
}

/// `DELETE /thumbnail/admin`
#[instrument(skip(state, headers))]
pub async fn handle_purge(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    let memory_purged = state.cache.clear_memory();

    let persistent_purged = match state.cache.persistent() {
        Some(store) => match store.purge_expired(Utc::now()).await {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(error = %e, "persistent purge failed");
                None
            }
        },
        None => Some(0),
    };

    info!(memory_purged, ?persistent_purged, "admin purge");
    Json(json!({
        "memory_purged": memory_purged,
        "persistent_purged": persistent_purged,
    }))
    .into_response()
}
