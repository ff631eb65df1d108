//! Credential exchange against the API's token endpoint
//!
//! The [`CredentialExchange`] trait is what [`TokenManager`](super::TokenManager)
//! talks to. [`HttpCredentialExchange`] is the production implementation: an
//! OAuth-style form POST with client basic auth.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::{ApiConfig, HttpConfig};
use crate::error::AuthError;
use crate::models::{Credential, TokenState};

/// Token endpoint operations
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialExchange: Send + Sync {
    /// Trade long-lived device credentials for a token
    async fn exchange_credentials(&self, credential: &Credential)
        -> Result<TokenState, AuthError>;

    /// Trade a refresh token for a new token
    async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<TokenState, AuthError>;

    /// Invalidate the session behind a token
    async fn invalidate(&self, token: &TokenState) -> Result<(), AuthError>;
}

/// Successful token endpoint response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    refresh_expires_in: Option<i64>,
    #[serde(default)]
    refresh_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    account_id: Option<String>,
}

/// Error body; both OAuth and vendor-style field names are accepted
#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    #[serde(default, alias = "errorCode")]
    error: Option<String>,
    #[serde(default, alias = "errorMessage")]
    error_description: Option<String>,
}

impl ErrorResponse {
    fn message(&self, status: StatusCode) -> String {
        match (&self.error, &self.error_description) {
            (Some(code), Some(desc)) => format!("{}: {}", code, desc),
            (Some(code), None) => code.clone(),
            (None, Some(desc)) => desc.clone(),
            (None, None) => format!("HTTP {}", status.as_u16()),
        }
    }
}

/// HTTP implementation of [`CredentialExchange`]
pub struct HttpCredentialExchange {
    client: Client,
    config: ApiConfig,
    clock: Arc<dyn Clock>,
}

impl HttpCredentialExchange {
    /// Create an exchange client for the configured token endpoint
    pub fn new(config: ApiConfig, http: &HttpConfig, clock: Arc<dyn Clock>) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(http.timeout_secs))
            .user_agent(http.user_agent.clone())
            .build()
            .map_err(|e| AuthError::Exchange(e.to_string()))?;

        Ok(Self {
            client,
            config,
            clock,
        })
    }

    async fn post_grant(
        &self,
        form: &[(&str, &str)],
        fallback_account: Option<&str>,
    ) -> Result<TokenState, AuthError> {
        if self.config.token_url.is_empty() {
            return Err(AuthError::Exchange("api.token_url is not configured".to_string()));
        }

        let response = self
            .client
            .post(&self.config.token_url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(form)
            .send()
            .await
            .map_err(|e| AuthError::Exchange(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body: ErrorResponse = response.json().await.unwrap_or_default();
            let message = body.message(status);
            warn!(status = status.as_u16(), error = %message, "Token exchange rejected");
            return Err(classify_rejection(status, message));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Exchange(format!("malformed token response: {}", e)))?;

        let now = self.clock.utc_now();
        let expires_at = match (body.expires_at, body.expires_in) {
            (Some(at), _) => at,
            (None, Some(secs)) => now + chrono::Duration::seconds(secs),
            (None, None) => {
                return Err(AuthError::Exchange(
                    "token response carries no expiry".to_string(),
                ))
            }
        };
        let refresh_expires_at = body
            .refresh_expires_at
            .or_else(|| body.refresh_expires_in.map(|s| now + chrono::Duration::seconds(s)));

        let issued_account_id = body
            .account_id
            .or_else(|| fallback_account.map(String::from))
            .unwrap_or_default();

        debug!(account = %issued_account_id, expires_at = %expires_at, "Token issued");

        Ok(TokenState {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            issued_account_id,
            expires_at,
            refresh_expires_at,
        })
    }
}

#[async_trait]
impl CredentialExchange for HttpCredentialExchange {
    async fn exchange_credentials(
        &self,
        credential: &Credential,
    ) -> Result<TokenState, AuthError> {
        self.post_grant(
            &[
                ("grant_type", "device_auth"),
                ("account_id", credential.subject_id.as_str()),
                ("device_id", credential.device_id.as_str()),
                ("secret", credential.shared_secret.as_str()),
            ],
            Some(&credential.subject_id),
        )
        .await
    }

    async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<TokenState, AuthError> {
        self.post_grant(
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ],
            None,
        )
        .await
    }

    async fn invalidate(&self, token: &TokenState) -> Result<(), AuthError> {
        let Some(template) = &self.config.logout_url else {
            return Ok(());
        };
        let url = template.replace("{token}", &token.access_token);

        let response = self
            .client
            .delete(&url)
            .bearer_auth(&token.access_token)
            .send()
            .await
            .map_err(|e| AuthError::Exchange(e.to_string()))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(classify_rejection(status, format!("HTTP {}", status.as_u16())))
        }
    }
}

/// Map a rejected exchange onto the auth failure taxonomy
fn classify_rejection(status: StatusCode, message: String) -> AuthError {
    match status {
        StatusCode::BAD_REQUEST => AuthError::InvalidCredentials(message),
        StatusCode::UNAUTHORIZED => AuthError::Unauthorized(message),
        StatusCode::FORBIDDEN => AuthError::Forbidden(message),
        _ => AuthError::Exchange(message),
    }
}
