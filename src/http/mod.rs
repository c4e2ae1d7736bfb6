pub mod admin;
pub mod handler;

use std::sync::Arc;

use crate::cache::CacheService;
use crate::config::Config;
use crate::metrics::MetricsRegistry;

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Arc<CacheService>,
    pub metrics: MetricsRegistry,
    /// Admin shared secret, resolved from the environment at startup.
    /// `None` means the admin endpoints reject everything.
    pub admin_secret: Option<String>,
}
