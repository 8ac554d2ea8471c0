//! Configuration for the extension controller.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the on-disk image cache.
    pub cache_dir: PathBuf,

    /// Interval between full resync passes.
    pub reconcile_interval: Duration,

    /// Default rollout deadline in minutes for extensions that do not set
    /// one; clamped to [10, 720] at use.
    pub progress_deadline_minutes: u32,

    /// Prompt retries allowed per extension within `retry_window` before a
    /// transiently failing extension is deferred to the resync tick.
    pub max_transient_retries: u32,

    /// Strike window for the transient retry budget.
    pub retry_window: Duration,

    /// Optional bearer token for registries.
    pub registry_token: Option<String>,

    /// Registries contacted over plain HTTP (local mirrors, test stubs).
    pub plain_http_hosts: Vec<String>,

    /// Base URL under which unpacked contents are served, if any.
    pub serve_base_url: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let cache_dir = std::env::var("HELION_CACHE_DIR")
            .unwrap_or_else(|_| "/var/lib/helion/images".to_string())
            .into();

        let reconcile_interval = std::env::var("HELION_RECONCILE_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(helion_reconcile::DEFAULT_RECONCILE_INTERVAL);

        let progress_deadline_minutes = std::env::var("HELION_PROGRESS_DEADLINE_MINUTES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let max_transient_retries = std::env::var("HELION_MAX_TRANSIENT_RETRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(helion_reconcile::DEFAULT_MAX_RETRIES);

        let retry_window = std::env::var("HELION_RETRY_WINDOW_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(helion_reconcile::DEFAULT_RETRY_WINDOW);

        let registry_token = std::env::var("HELION_REGISTRY_TOKEN").ok();

        let plain_http_hosts = std::env::var("HELION_PLAIN_HTTP_HOSTS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|h| !h.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let serve_base_url = std::env::var("HELION_SERVE_BASE_URL").ok();

        let log_level = std::env::var("HELION_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            cache_dir,
            reconcile_interval,
            progress_deadline_minutes,
            max_transient_retries,
            retry_window,
            registry_token,
            plain_http_hosts,
            serve_base_url,
            log_level,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/var/lib/helion/images"),
            reconcile_interval: helion_reconcile::DEFAULT_RECONCILE_INTERVAL,
            progress_deadline_minutes: 10,
            max_transient_retries: helion_reconcile::DEFAULT_MAX_RETRIES,
            retry_window: helion_reconcile::DEFAULT_RETRY_WINDOW,
            registry_token: None,
            plain_http_hosts: Vec::new(),
            serve_base_url: None,
            log_level: "info".to_string(),
        }
    }
}
