//! Authentication for the game-platform API
//!
//! - [`exchange`]: token endpoint client
//! - [`manager`]: bearer token lifecycle with single-flight refresh

pub mod exchange;
pub mod manager;

pub use exchange::{CredentialExchange, HttpCredentialExchange};
pub use manager::{TokenManager, TokenManagerState};

use async_trait::async_trait;

use crate::error::AuthError;

/// Source of bearer tokens for authenticated requests
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A token that is not about to expire
    async fn get_token(&self) -> Result<String, AuthError>;

    /// A replacement token after the remote rejected the current one
    async fn refresh(&self) -> Result<String, AuthError>;
}
