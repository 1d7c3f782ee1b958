//! Configuration module
//!
//! Builds the monitor configuration from the command line and the
//! environment, and the HTTP client shared by one-shot commands.

use anyhow::{Context, Result};
use vigil_client::VigilClient;
use vigil_monitor::MonitorConfig;

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub monitor: MonitorConfig,
}

impl Config {
    /// Load configuration for the backend at `url`
    ///
    /// Tuning values come from the `VIGIL_*` environment variables.
    pub fn load(url: String) -> Result<Self> {
        let monitor = MonitorConfig::new(url).with_env_overrides();
        monitor.validate().context("Invalid configuration")?;
        Ok(Self { monitor })
    }

    /// HTTP client for the configured backend
    pub fn client(&self) -> Result<VigilClient> {
        let http = reqwest::Client::builder()
            .connect_timeout(self.monitor.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(VigilClient::with_client(self.monitor.base_url.as_str(), http))
    }
}
