//! Hive HTTP Client
//!
//! A thin, type-safe HTTP client for the master's worker API.
//!
//! The client only maps requests and responses; retry policy, re-enroll
//! decisions and task bookkeeping belong to the worker.
//!
//! # Example
//!
//! ```no_run
//! use hive_client::MasterClient;
//!
//! #[tokio::main]
//! async fn main() -> hive_client::Result<()> {
//!     let client = MasterClient::new("http://localhost:8000");
//!     let reply = client.enroll("worker-uuid", "passcode").await?;
//!     println!("enrolled: {}", reply.auth_token.is_some());
//!     Ok(())
//! }
//! ```

pub mod error;
mod logs;
mod tasks;
mod workers;

pub use error::{ClientError, Result};
pub use workers::PollReply;

use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::debug;

/// HTTP client for the master's worker API
///
/// Endpoints are organized into logical groups:
/// - Worker identity (register, enroll, poll)
/// - Task reporting (progress, finish, failure, tensorboard)
/// - Log shipping
#[derive(Debug, Clone)]
pub struct MasterClient {
    /// Base URL of the master (e.g., "http://localhost:8000")
    base_url: String,
    /// HTTP client instance
    client: Client,
}

impl MasterClient {
    /// Create a new master client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the master API (e.g., "http://localhost:8000")
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    /// Create a new master client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Get the base URL of the master
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Handle an API response and deserialize JSON
    ///
    /// Non-2xx statuses become [`ClientError::ApiError`] carrying the status so
    /// callers can tell auth, validation and server failures apart.
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            return Err(Self::api_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Like [`Self::handle_response`], but any 2xx is success and a missing
    /// or unparsable body falls back to `T::default()`
    async fn handle_ack<T: DeserializeOwned + Default>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            return Err(Self::api_error(response).await);
        }

        let body = response.text().await.unwrap_or_default();
        if body.trim().is_empty() {
            return Ok(T::default());
        }

        Ok(serde_json::from_str(&body).unwrap_or_else(|e| {
            debug!(status = status.as_u16(), "Ignoring unparsable acknowledgment body: {}", e);
            T::default()
        }))
    }

    async fn api_error(response: reqwest::Response) -> ClientError {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        debug!(status = status.as_u16(), "Master returned an error: {}", error_text);
        ClientError::api_error(status.as_u16(), error_text)
    }
}
