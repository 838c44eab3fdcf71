//! Sluice gate client
//!
//! A thin, typed HTTP client for the `/gate` endpoints the runner consumes:
//! registration, heartbeats, task polling, status transitions and log
//! appends.
//!
//! # Example
//!
//! ```no_run
//! use sluice_client::GateClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), sluice_client::ClientError> {
//!     let client = GateClient::new("http://localhost:8080");
//!     let registration = client.register("builder-01", "secret", "0.1.0").await?;
//!     println!("Registered as {}", registration.runner_id);
//!     client.heartbeat().await?;
//!     Ok(())
//! }
//! ```

pub mod error;
mod pipelines;
mod runners;
mod tasks;

pub use error::{ClientError, Result};

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::sync::{Arc, RwLock};

/// HTTP client for the gate API
///
/// Holds the access token obtained at registration and attaches it to every
/// request as a bearer token.
#[derive(Debug, Clone)]
pub struct GateClient {
    /// Base URL of the gate (e.g., "http://localhost:8080")
    base_url: String,
    /// HTTP client instance
    client: Client,
    /// Access token issued by `register`
    token: Arc<RwLock<Option<String>>>,
}

impl GateClient {
    /// Create a new gate client
    ///
    /// # Example
    /// ```
    /// use sluice_client::GateClient;
    ///
    /// let client = GateClient::new("http://localhost:8080");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new gate client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            token: Arc::new(RwLock::new(None)),
        }
    }

    /// Get the base URL of the gate
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Replace the access token used for authenticated calls
    pub fn set_access_token(&self, token: impl Into<String>) {
        let mut guard = self.token.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(token.into());
    }

    fn url(&self, path: &str) -> String {
        format!("{}/gate{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let guard = self.token.read().unwrap_or_else(|e| e.into_inner());
        match guard.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Handle an API response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Handle an API response that returns no content
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(())
    }
}
