use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use thumbcache::cache::CacheService;
use thumbcache::config::{self, Config};
use thumbcache::fetch::Fetcher;
use thumbcache::http::{handler, AppState};
use thumbcache::metrics::MetricsRegistry;
use thumbcache::store::postgres::PostgresMetadataStore;
use thumbcache::store::s3::S3BlobStore;
use thumbcache::store::{PersistentCache, PersistentPolicy};
use thumbcache::validate::ValidationPolicy;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "thumbcache", about = "Caching proxy for third-party CDN thumbnails")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<String>,
}

// ---------------------------------------------------------------------------
// Persistent tier construction
// ---------------------------------------------------------------------------

/// Build the persistent tier, degrading to "disabled" when either store is
/// unconfigured or its credentials are missing.  The proxy must come up and
/// serve from memory + upstream regardless.
async fn build_persistent_cache(config: &Config) -> Option<Arc<PersistentCache>> {
    let (Some(pg_config), Some(s3_config)) =
        (&config.persistent.postgres, &config.persistent.s3)
    else {
        tracing::warn!("persistent cache disabled: postgres/s3 not configured");
        return None;
    };

    let Ok(database_url) = std::env::var(&pg_config.url_env) else {
        tracing::warn!(
            env = %pg_config.url_env,
            "persistent cache disabled: database URL env var not set"
        );
        return None;
    };

    let meta = match PostgresMetadataStore::connect(&database_url, pg_config).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "persistent cache disabled: metadata store unreachable");
            return None;
        }
    };

    let blobs = match S3BlobStore::from_config(s3_config).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "persistent cache disabled: blob store init failed");
            return None;
        }
    };

    Some(Arc::new(PersistentCache::new(
        Arc::new(meta),
        Arc::new(blobs),
        PersistentPolicy::from_config(&config.persistent),
    )))
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let app = handler::create_router(Arc::new(state.clone()));

    let listen_addr: std::net::SocketAddr = state
        .config
        .proxy
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Config ----
    let config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => {
            tracing::info!("no config file given, using defaults");
            Config::default()
        }
    };
    let config = Arc::new(config);

    tracing::info!(listen = %config.proxy.http_listen, "starting thumbcache");

    // ---- Infrastructure ----
    let persistent = build_persistent_cache(&config).await;

    let http_client = reqwest::Client::builder()
        .user_agent("thumbcache/0.1")
        .build()
        .context("failed to build HTTP client")?;

    let metrics = MetricsRegistry::new();

    let policy = Arc::new(ValidationPolicy::new(&config.allowlist));
    let fetcher = Fetcher::new(http_client, policy, config.upstream.clone());
    let cache = Arc::new(CacheService::new(
        &config,
        persistent,
        fetcher,
        metrics.clone(),
    ));

    let admin_secret = std::env::var(&config.proxy.admin_secret_env).ok();
    if admin_secret.is_none() {
        tracing::warn!(
            env = %config.proxy.admin_secret_env,
            "admin secret not set; admin endpoints disabled"
        );
    }

    let state = AppState {
        config: Arc::clone(&config),
        cache,
        metrics,
        admin_secret,
    };

    run_http_server(state).await
}
