//! Vigil HTTP Client
//!
//! A type-safe client for the job backend: job snapshots, paginated job
//! summaries, log snapshots, live log streams (server-sent events) and
//! job commands.
//!
//! # Example
//!
//! ```no_run
//! use vigil_client::VigilClient;
//! use vigil_core::dto::job::JobFilter;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = VigilClient::new("http://localhost:8080");
//!
//!     let page = client.list_jobs(&JobFilter::default()).await?;
//!     println!("{} job(s) in view", page.items.len());
//!     Ok(())
//! }
//! ```

pub mod error;
mod jobs;
mod logs;
pub mod sse;

// Re-export commonly used types
pub use error::{ClientError, Result};
pub use logs::LogEventStream;

use reqwest::Client;
use serde::de::DeserializeOwned;

/// HTTP client for the job backend API
///
/// Endpoints are grouped into:
/// - Job snapshots and summaries
/// - Job commands (cancel, bulk status change)
/// - Log snapshots and live log streams
#[derive(Debug, Clone)]
pub struct VigilClient {
    /// Base URL of the backend (e.g., "http://localhost:8080")
    base_url: String,
    /// HTTP client instance
    client: Client,
}

impl VigilClient {
    /// Create a new client
    ///
    /// # Example
    /// ```
    /// use vigil_client::VigilClient;
    ///
    /// let client = VigilClient::new("http://localhost:8080");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    /// Keep in mind that a total request timeout also bounds live log
    /// streams; prefer `connect_timeout` when streams should stay open.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Get the base URL of the backend
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Turn a non-success status into a [`ClientError`]
    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(response)
    }

    /// Handle an API response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        self.check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }
}
