use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub memory_cache: MemoryCacheConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub persistent: PersistentConfig,
    #[serde(default)]
    pub allowlist: AllowlistConfig,
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
    /// Name of the environment variable that holds the admin shared secret.
    ///
    /// When the variable is unset the admin endpoints reject every request.
    #[serde(default = "default_admin_secret_env")]
    pub admin_secret_env: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
            admin_secret_env: default_admin_secret_env(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_admin_secret_env() -> String {
    "THUMBCACHE_ADMIN_SECRET".to_string()
}

// ---------------------------------------------------------------------------
// Memory cache (L1)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryCacheConfig {
    /// Maximum number of entries held in process memory.
    #[serde(default = "default_memory_capacity")]
    pub capacity: usize,
    /// TTL (seconds) of a memory entry, checked on read.
    #[serde(default = "default_memory_ttl")]
    pub ttl_secs: u64,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_memory_capacity(),
            ttl_secs: default_memory_ttl(),
        }
    }
}

fn default_memory_capacity() -> usize {
    500
}

fn default_memory_ttl() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// Upstream fetch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Per-attempt timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Maximum fetch attempts (first attempt included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base backoff delay in milliseconds; retry n waits
    /// `min(base * 2^(n-1), cap)` plus jitter.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Upper bound on a single backoff delay in milliseconds.
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    300
}

fn default_backoff_cap_ms() -> u64 {
    3_000
}

// ---------------------------------------------------------------------------
// Persistent cache (L2)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PersistentConfig {
    /// Seconds until a stored entry is considered stale (soft TTL).
    #[serde(default = "default_soft_ttl")]
    pub soft_ttl_secs: u64,
    /// Seconds until a stored entry must no longer be served (hard TTL).
    #[serde(default = "default_hard_ttl")]
    pub hard_ttl_secs: u64,
    /// Payloads at or below this size are inlined into the metadata row,
    /// skipping the blob store on reads.
    #[serde(default = "default_inline_max_bytes")]
    pub inline_max_bytes: usize,
    /// Base delay (seconds) before a failed refresh may be retried.
    #[serde(default = "default_refresh_backoff_base")]
    pub refresh_backoff_base_secs: u64,
    /// Upper bound (seconds) on the refresh retry delay.
    #[serde(default = "default_refresh_backoff_cap")]
    pub refresh_backoff_cap_secs: u64,
    /// Metadata store connection. Absent section disables the persistent tier.
    #[serde(default)]
    pub postgres: Option<PostgresConfig>,
    /// Blob store connection. Absent section disables the persistent tier.
    #[serde(default)]
    pub s3: Option<S3Config>,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            soft_ttl_secs: default_soft_ttl(),
            hard_ttl_secs: default_hard_ttl(),
            inline_max_bytes: default_inline_max_bytes(),
            refresh_backoff_base_secs: default_refresh_backoff_base(),
            refresh_backoff_cap_secs: default_refresh_backoff_cap(),
            postgres: None,
            s3: None,
        }
    }
}

fn default_soft_ttl() -> u64 {
    86_400
}

fn default_hard_ttl() -> u64 {
    7 * 86_400
}

fn default_inline_max_bytes() -> usize {
    16 * 1024
}

fn default_refresh_backoff_base() -> u64 {
    60
}

fn default_refresh_backoff_cap() -> u64 {
    3_600
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    /// Name of the environment variable that holds the connection URL.
    #[serde(default = "default_database_url_env")]
    pub url_env: String,
    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_database_url_env() -> String {
    "THUMBCACHE_DATABASE_URL".to_string()
}

fn default_pool_size() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default = "default_s3_region")]
    pub region: String,
    /// Key prefix inside the bucket (e.g. `thumbs/`).
    #[serde(default = "default_s3_prefix")]
    pub prefix: String,
    /// Custom endpoint for S3-compatible stores (MinIO, Ceph, ...).
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "bool_true")]
    pub force_path_style: bool,
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_s3_prefix() -> String {
    "thumbs/".to_string()
}

fn bool_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Allowlist
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AllowlistConfig {
    /// CDN hostname suffixes that may be fetched from.
    #[serde(default = "default_cdn_suffixes")]
    pub cdn_suffixes: Vec<String>,
    /// Platform hostnames allowed only for media paths (`/p/`, `/reel/`,
    /// `/reels/`, `/tv/`).
    #[serde(default = "default_platform_hosts")]
    pub platform_hosts: Vec<String>,
    /// Permit private / loopback upstream addresses. Intended for local
    /// development and the test suite only.
    #[serde(default)]
    pub allow_private_hosts: bool,
}

impl Default for AllowlistConfig {
    fn default() -> Self {
        Self {
            cdn_suffixes: default_cdn_suffixes(),
            platform_hosts: default_platform_hosts(),
            allow_private_hosts: false,
        }
    }
}

fn default_cdn_suffixes() -> Vec<String> {
    vec!["cdninstagram.com".to_string(), "fbcdn.net".to_string()]
}

fn default_platform_hosts() -> Vec<String> {
    vec!["instagram.com".to_string(), "www.instagram.com".to_string()]
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load and validate configuration from a YAML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.upstream.max_attempts >= 1,
        "upstream.max_attempts must be at least 1"
    );
    anyhow::ensure!(
        config.memory_cache.capacity >= 1,
        "memory_cache.capacity must be at least 1"
    );
    anyhow::ensure!(
        config.persistent.hard_ttl_secs > config.persistent.soft_ttl_secs,
        "persistent.hard_ttl_secs must be greater than soft_ttl_secs"
    );
    anyhow::ensure!(
        config.upstream.backoff_cap_ms >= config.upstream.backoff_base_ms,
        "upstream.backoff_cap_ms must be >= backoff_base_ms"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        validate_config(&config).unwrap();
        assert!(config.persistent.postgres.is_none());
        assert!(!config.allowlist.allow_private_hosts);
    }

    #[test]
    fn minimal_yaml_parses_with_defaults() {
        let config: Config =
            serde_yaml::from_str("proxy:\n  http_listen: 127.0.0.1:9999\n").unwrap();
        assert_eq!(config.proxy.http_listen, "127.0.0.1:9999");
        assert_eq!(config.upstream.max_attempts, 3);
        assert_eq!(
            config.allowlist.cdn_suffixes,
            vec!["cdninstagram.com", "fbcdn.net"]
        );
    }

    #[test]
    fn inverted_ttls_rejected() {
        let mut config = Config::default();
        config.persistent.soft_ttl_secs = 100;
        config.persistent.hard_ttl_secs = 50;
        assert!(validate_config(&config).is_err());
    }
}
