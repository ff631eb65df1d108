//! Credential and bearer-token models

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::StaticCredentialConfig;

/// Where a credential was resolved from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialOrigin {
    /// Process configuration
    Static,
    /// Credential store
    Persisted,
}

/// Long-lived device credentials for the authenticated API
///
/// Never mutated. Rotation stores a new credential and the old one stops
/// being selected.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Store row id, or `"static"` for configuration credentials
    pub source_id: String,
    /// Device id
    pub device_id: String,
    /// Device secret
    pub shared_secret: String,
    /// Account the device belongs to
    pub subject_id: String,
    /// Where it came from
    pub origin: CredentialOrigin,
}

impl Credential {
    /// Credential supplied through configuration
    pub fn from_static(config: &StaticCredentialConfig) -> Self {
        Self {
            source_id: "static".to_string(),
            device_id: config.device_id.clone(),
            shared_secret: config.secret.clone(),
            subject_id: config.subject_id.clone(),
            origin: CredentialOrigin::Static,
        }
    }

    /// Credential loaded from the store
    pub fn persisted(
        id: impl Into<String>,
        subject_id: impl Into<String>,
        device_id: impl Into<String>,
        shared_secret: impl Into<String>,
    ) -> Self {
        Self {
            source_id: id.into(),
            device_id: device_id.into(),
            shared_secret: shared_secret.into(),
            subject_id: subject_id.into(),
            origin: CredentialOrigin::Persisted,
        }
    }

    /// Same device for the same account, regardless of origin
    pub fn same_device(&self, other: &Credential) -> bool {
        self.subject_id == other.subject_id && self.device_id == other.device_id
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("source_id", &self.source_id)
            .field("device_id", &self.device_id)
            .field("shared_secret", &"<redacted>")
            .field("subject_id", &self.subject_id)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Device-credential material as stored
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretMaterial {
    /// Device id
    pub device_id: String,
    /// Device secret
    pub secret: String,
}

impl std::fmt::Debug for SecretMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretMaterial")
            .field("device_id", &self.device_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// The live bearer session
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    /// Bearer token
    pub access_token: String,
    /// Token usable for a refresh-token exchange
    pub refresh_token: Option<String>,
    /// Account the token was issued to
    pub issued_account_id: String,
    /// Access token expiry
    pub expires_at: DateTime<Utc>,
    /// Refresh token expiry
    pub refresh_expires_at: Option<DateTime<Utc>>,
}

impl TokenState {
    /// True once `now` is inside the refresh window before expiry
    pub fn needs_refresh(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        now >= self.expires_at - buffer
    }

    /// The refresh token, if present and not yet expired
    pub fn usable_refresh_token(&self, now: DateTime<Utc>) -> Option<&str> {
        let token = self.refresh_token.as_deref()?;
        match self.refresh_expires_at {
            Some(expires) if now >= expires => None,
            _ => Some(token),
        }
    }

    /// Status view without secrets
    pub fn info(&self) -> TokenInfo {
        TokenInfo {
            issued_account_id: self.issued_account_id.clone(),
            expires_at: self.expires_at,
            refresh_expires_at: self.refresh_expires_at,
            has_refresh_token: self.refresh_token.is_some(),
        }
    }
}

impl std::fmt::Debug for TokenState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenState")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("issued_account_id", &self.issued_account_id)
            .field("expires_at", &self.expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .finish()
    }
}

/// Token metadata safe to print
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    /// Account the token was issued to
    pub issued_account_id: String,
    /// Access token expiry
    pub expires_at: DateTime<Utc>,
    /// Refresh token expiry
    pub refresh_expires_at: Option<DateTime<Utc>>,
    /// Whether a refresh token is held
    pub has_refresh_token: bool,
}
