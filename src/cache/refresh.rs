//! Background refresh of stale persistent entries.
//!
//! At most one refresh per key runs across the whole fleet: the metadata
//! store's conditional update is the lock, and losing it is the normal
//! "someone else got there first" outcome.  The refresh itself is a
//! detached task — the request that noticed staleness never awaits it,
//! cancelling that request must not cancel the refresh, and refresh errors
//! are logged, never propagated.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, warn};

use crate::fetch::Fetcher;
use crate::metrics::MetricsRegistry;
use crate::store::PersistentCache;
use crate::validate::CanonicalUrl;

/// Spawn a detached refresh for a stale key.  Returns immediately.
pub fn spawn_refresh(
    store: Arc<PersistentCache>,
    fetcher: Fetcher,
    canon: CanonicalUrl,
    metrics: MetricsRegistry,
) {
    tokio::spawn(async move {
        if let Err(e) = run_refresh(&store, &fetcher, &canon, &metrics).await {
            metrics.refresh_failed.inc();
            warn!(key = %canon.key, error = %e, "background refresh failed");
        }
    });
}

async fn run_refresh(
    store: &PersistentCache,
    fetcher: &Fetcher,
    canon: &CanonicalUrl,
    metrics: &MetricsRegistry,
) -> Result<()> {
    let meta = store.metadata();
    let now = Utc::now();

    if !meta
        .try_acquire_refresh(&canon.key, now)
        .await
        .context("refresh lock acquire")?
    {
        metrics.refresh_skipped.inc();
        debug!(key = %canon.key, "refresh already running elsewhere, skipping");
        return Ok(());
    }
    metrics.refresh_started.inc();

    let outcome = refresh_body(store, fetcher, canon).await;

    let result = match outcome {
        // The write-through upsert already cleared `refreshing`, reset the
        // failure counter, and extended both TTLs in one statement.
        Ok(()) => {
            debug!(key = %canon.key, "background refresh succeeded");
            Ok(())
        }
        Err(e) => {
            // Bookkeeping errors must not skip the lock release below, so
            // they are logged instead of propagated.
            let policy = store.policy();
            if let Err(book_err) = meta
                .fail_refresh(
                    &canon.key,
                    Utc::now(),
                    policy.refresh_backoff_base,
                    policy.refresh_backoff_cap,
                )
                .await
            {
                warn!(key = %canon.key, error = %book_err, "refresh failure bookkeeping failed");
            }
            Err(e)
        }
    };

    // Safety net against an unhandled error path leaving the lock held
    // forever.  Known race: a refresh for the same key started after this
    // one finished can have its freshly-acquired lock cleared here, letting
    // a third refresh start concurrently.  Kept as-is deliberately.
    meta.clear_refreshing(&canon.key)
        .await
        .context("clear refreshing safety net")?;

    result
}

async fn refresh_body(
    store: &PersistentCache,
    fetcher: &Fetcher,
    canon: &CanonicalUrl,
) -> Result<()> {
    // Re-validate before refetching; allowlist config may have changed since
    // the entry was first cached.
    fetcher
        .policy()
        .check(&canon.url)
        .map_err(|reason| anyhow::anyhow!("refresh URL denied: {}", reason.as_str()))?;

    let image = fetcher
        .fetch(canon)
        .await
        .context("refresh upstream fetch")?;
    store
        .write(&canon.key, &canon.canonical, &image, Utc::now())
        .await
        .context("refresh write-through")
}
