//! Monitor configuration
//!
//! Polling cadence, staleness threshold and retry bounds for a monitoring
//! session, plus the backend location.

use std::time::Duration;

/// Monitor configuration
///
/// All intervals are configurable to allow tuning for different
/// deployments (local backend vs remote, chatty vs quiet jobs).
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Backend base URL (e.g., "http://localhost:8080")
    pub base_url: String,

    /// How often job summaries are re-fetched while any job in view is active
    pub poll_interval: Duration,

    /// A non-terminal job with no activity for this long is flagged stale
    pub stale_after: Duration,

    /// Page size used when no explicit filter is given
    pub page_size: u32,

    /// Consecutive failed stream reopen attempts allowed per job
    pub max_stream_restarts: u32,

    /// Connect timeout for backend requests
    pub request_timeout: Duration,
}

impl MonitorConfig {
    /// Creates a new configuration with defaults
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            poll_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(60),
            page_size: 20,
            max_stream_restarts: 5,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - VIGIL_URL (required)
    /// - VIGIL_POLL_INTERVAL (optional, seconds, default: 5)
    /// - VIGIL_STALE_AFTER (optional, seconds, default: 60)
    /// - VIGIL_PAGE_SIZE (optional, default: 20)
    /// - VIGIL_MAX_STREAM_RESTARTS (optional, default: 5)
    /// - VIGIL_REQUEST_TIMEOUT (optional, seconds, default: 30)
    pub fn from_env() -> anyhow::Result<Self> {
        let base_url = std::env::var("VIGIL_URL")
            .map_err(|_| anyhow::anyhow!("VIGIL_URL environment variable not set"))?;

        Ok(Self::new(base_url).with_env_overrides())
    }

    /// Applies the optional tuning variables of [`from_env`](Self::from_env)
    /// on top of this configuration, keeping its base URL
    pub fn with_env_overrides(self) -> Self {
        Self {
            poll_interval: env_secs("VIGIL_POLL_INTERVAL").unwrap_or(self.poll_interval),
            stale_after: env_secs("VIGIL_STALE_AFTER").unwrap_or(self.stale_after),
            page_size: env_parse("VIGIL_PAGE_SIZE").unwrap_or(self.page_size),
            max_stream_restarts: env_parse("VIGIL_MAX_STREAM_RESTARTS")
                .unwrap_or(self.max_stream_restarts),
            request_timeout: env_secs("VIGIL_REQUEST_TIMEOUT").unwrap_or(self.request_timeout),
            ..self
        }
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_url.is_empty() {
            anyhow::bail!("base_url cannot be empty");
        }

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            anyhow::bail!("base_url must start with http:// or https://");
        }

        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.stale_after < self.poll_interval {
            anyhow::bail!("stale_after must not be shorter than poll_interval");
        }

        if self.page_size == 0 {
            anyhow::bail!("page_size must be greater than 0");
        }

        Ok(())
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::new("http://localhost:8080".to_string())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}
