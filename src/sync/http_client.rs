//! Rate-limit aware HTTP client for remote catalogs
//!
//! [`RemoteClient`] maps HTTP outcomes onto [`SyncError`], reports throttling
//! to the shared [`HostRateLimiter`] and handles the one-refresh-one-retry
//! rule for bearer-authenticated calls. Slot acquisition is done by the
//! caller before each logical request; the client only acquires again for
//! the retry it issues itself.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::rate_limiter::{host_key, HostRateLimiter};
use crate::auth::TokenProvider;
use crate::config::HttpConfig;
use crate::error::SyncError;

/// HTTP client shared by every catalog source
pub struct RemoteClient {
    client: Client,
    limiter: Arc<HostRateLimiter>,
}

impl RemoteClient {
    /// Create a client with the configured timeout and user agent
    pub fn new(config: &HttpConfig, limiter: Arc<HostRateLimiter>) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| SyncError::Network(e.to_string()))?;

        Ok(Self::with_client(client, limiter))
    }

    /// Create a client around an existing reqwest Client
    pub fn with_client(client: Client, limiter: Arc<HostRateLimiter>) -> Self {
        Self { client, limiter }
    }

    /// The shared limiter
    pub fn limiter(&self) -> &Arc<HostRateLimiter> {
        &self.limiter
    }

    /// Perform an unauthenticated GET
    pub async fn get(&self, url: &str) -> Result<Bytes, SyncError> {
        self.send(self.client.get(url), url).await
    }

    /// GET and decode a JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, SyncError> {
        let body = self.get(url).await?;
        decode(&body, url)
    }

    /// GET with a bearer token, refreshing once on 401/403
    pub async fn get_json_authed<T: DeserializeOwned>(
        &self,
        url: &str,
        tokens: &dyn TokenProvider,
    ) -> Result<T, SyncError> {
        let token = tokens.get_token().await?;

        let body = match self.send(self.client.get(url).bearer_auth(&token), url).await {
            Err(SyncError::Unauthorized | SyncError::Forbidden) => {
                warn!(url = url, "Bearer token rejected, refreshing once");
                let token = tokens.refresh().await?;
                self.limiter.acquire(&host_key(url)).await;
                self.send(self.client.get(url).bearer_auth(&token), url)
                    .await?
            }
            other => other?,
        };

        decode(&body, url)
    }

    async fn send(&self, request: RequestBuilder, url: &str) -> Result<Bytes, SyncError> {
        let host = host_key(url);
        debug!(url = url, "Sending HTTP GET request");

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SyncError::NetworkTimeout
            } else if e.is_connect() {
                SyncError::ConnectionRefused
            } else {
                SyncError::Network(e.to_string())
            }
        })?;

        match response.status() {
            status if status.is_success() => {
                self.limiter.record_success(&host);
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| SyncError::Network(e.to_string()))?;
                debug!(url = url, body_size = body.len(), "Received response");
                Ok(body)
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);

                let delay = self.limiter.penalize(&host, retry_after);
                warn!(url = url, retry_after_secs = delay.as_secs(), "Rate limited by upstream");
                Err(SyncError::RateLimited(delay.as_secs()))
            }
            StatusCode::NOT_FOUND => {
                debug!(url = url, "Resource not found (404)");
                Err(SyncError::NotFound)
            }
            StatusCode::UNAUTHORIZED => {
                warn!(url = url, "Unauthorized (401)");
                Err(SyncError::Unauthorized)
            }
            StatusCode::FORBIDDEN => {
                warn!(url = url, "Forbidden (403)");
                Err(SyncError::Forbidden)
            }
            status => {
                warn!(url = url, status = status.as_u16(), "Unexpected status");
                Err(SyncError::ServerError(status.as_u16()))
            }
        }
    }
}

fn decode<T: DeserializeOwned>(body: &[u8], url: &str) -> Result<T, SyncError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(SyncError::Empty(format!("empty body from {}", url)));
    }
    serde_json::from_slice(body).map_err(|e| SyncError::InvalidData(e.to_string()))
}
