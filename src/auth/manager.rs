//! Bearer token lifecycle
//!
//! [`TokenManager`] owns the single live [`TokenState`] for the process. It
//! resolves credentials in priority order, refreshes ahead of expiry and
//! collapses concurrent refreshes into one exchange.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use super::exchange::CredentialExchange;
use super::TokenProvider;
use crate::clock::Clock;
use crate::config::ApiConfig;
use crate::database::CredentialStore;
use crate::error::AuthError;
use crate::models::{Credential, CredentialOrigin, TokenInfo, TokenState};

/// Lifecycle state of the token manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenManagerState {
    /// No token has been requested yet
    Uninitialized,
    /// First exchange in flight
    Initializing,
    /// Holding a usable token
    Ready,
    /// Replacing an existing token
    Refreshing,
    /// Last exchange failed; the next request retries
    Failed,
}

impl std::fmt::Display for TokenManagerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TokenManagerState::Uninitialized => "uninitialized",
            TokenManagerState::Initializing => "initializing",
            TokenManagerState::Ready => "ready",
            TokenManagerState::Refreshing => "refreshing",
            TokenManagerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

type PendingExchange = Shared<BoxFuture<'static, Result<TokenState, AuthError>>>;

struct Session {
    state: TokenManagerState,
    token: Option<TokenState>,
    pending: Option<PendingExchange>,
    generation: u64,
    last_error: Option<AuthError>,
}

struct Inner {
    exchange: Arc<dyn CredentialExchange>,
    store: Option<Arc<dyn CredentialStore>>,
    static_credential: Option<Credential>,
    clock: Arc<dyn Clock>,
    refresh_buffer: chrono::Duration,
    session: Mutex<Session>,
}

/// Shared bearer token manager
///
/// Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

impl TokenManager {
    /// Create a manager over an exchange and an optional credential store
    pub fn new(
        config: &ApiConfig,
        exchange: Arc<dyn CredentialExchange>,
        store: Option<Arc<dyn CredentialStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                exchange,
                store,
                static_credential: config.credentials.as_ref().map(Credential::from_static),
                clock,
                refresh_buffer: chrono::Duration::seconds(config.refresh_buffer_secs as i64),
                session: Mutex::new(Session {
                    state: TokenManagerState::Uninitialized,
                    token: None,
                    pending: None,
                    generation: 0,
                    last_error: None,
                }),
            }),
        }
    }

    /// Obtain the first token if none is held
    ///
    /// `AuthError::NoCredentials` means nothing is configured yet; callers
    /// that only use public sources can carry on.
    pub async fn initialize(&self) -> Result<(), AuthError> {
        if self.inner.session.lock().unwrap().token.is_some() {
            return Ok(());
        }
        self.join_or_start().await.map(|_| ())
    }

    /// A bearer token outside the refresh window
    pub async fn get_token(&self) -> Result<String, AuthError> {
        {
            let session = self.inner.session.lock().unwrap();
            if let Some(token) = &session.token {
                if !token.needs_refresh(self.inner.clock.utc_now(), self.inner.refresh_buffer) {
                    return Ok(token.access_token.clone());
                }
            }
        }

        let token = self.join_or_start().await?;
        self.usable(token)
    }

    /// Replace the current token, joining any exchange already in flight
    pub async fn refresh(&self) -> Result<String, AuthError> {
        let token = self.join_or_start().await?;
        self.usable(token)
    }

    /// Drop the token and forget any in-flight exchange
    pub fn reset(&self) -> Option<TokenState> {
        let mut session = self.inner.session.lock().unwrap();
        session.generation += 1;
        session.pending = None;
        session.last_error = None;
        session.state = TokenManagerState::Uninitialized;
        session.token.take()
    }

    /// Invalidate the session remotely, then reset
    pub async fn logout(&self) {
        let Some(token) = self.reset() else {
            return;
        };
        match self.inner.exchange.invalidate(&token).await {
            Ok(()) => info!(account = %token.issued_account_id, "Session invalidated"),
            Err(e) => warn!(error = %e, "Session invalidation failed"),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> TokenManagerState {
        self.inner.session.lock().unwrap().state
    }

    /// Error from the most recent failed exchange
    pub fn last_error(&self) -> Option<AuthError> {
        self.inner.session.lock().unwrap().last_error.clone()
    }

    /// Metadata of the held token
    pub fn token_info(&self) -> Option<TokenInfo> {
        self.inner
            .session
            .lock()
            .unwrap()
            .token
            .as_ref()
            .map(TokenState::info)
    }

    fn usable(&self, token: TokenState) -> Result<String, AuthError> {
        if token.needs_refresh(self.inner.clock.utc_now(), self.inner.refresh_buffer) {
            warn!(expires_at = %token.expires_at, "Issued token is already inside the refresh window");
            return Err(AuthError::TokenExpired);
        }
        Ok(token.access_token)
    }

    async fn join_or_start(&self) -> Result<TokenState, AuthError> {
        let pending = {
            let mut session = self.inner.session.lock().unwrap();
            match &session.pending {
                Some(pending) => {
                    debug!("Joining in-flight token exchange");
                    pending.clone()
                }
                None => {
                    let generation = session.generation;
                    let refresh_token = session.token.as_ref().and_then(|t| {
                        t.usable_refresh_token(self.inner.clock.utc_now())
                            .map(String::from)
                    });
                    session.state = if session.token.is_some() {
                        TokenManagerState::Refreshing
                    } else {
                        TokenManagerState::Initializing
                    };

                    let inner = self.inner.clone();
                    let pending = async move {
                        let result = inner.obtain(refresh_token).await;
                        inner.settle(generation, &result);
                        result
                    }
                    .boxed()
                    .shared();

                    session.pending = Some(pending.clone());
                    pending
                }
            }
        };

        pending.await
    }
}

impl Inner {
    /// Refresh token first, then credentials
    async fn obtain(&self, refresh_token: Option<String>) -> Result<TokenState, AuthError> {
        if let Some(refresh_token) = refresh_token {
            match self.exchange.exchange_refresh_token(&refresh_token).await {
                Ok(token) => {
                    info!(account = %token.issued_account_id, "Token refreshed");
                    return Ok(token);
                }
                Err(e) => {
                    warn!(error = %e, "Refresh token rejected, falling back to credentials");
                }
            }
        }

        self.exchange_credentials().await
    }

    /// Static credential, then the store's most recently used one
    async fn exchange_credentials(&self) -> Result<TokenState, AuthError> {
        let mut last_error = None;

        if let Some(credential) = &self.static_credential {
            match self.try_credential(credential).await {
                Ok(token) => return Ok(token),
                Err(e) => last_error = Some(e),
            }
        }

        match self.persisted_credential().await {
            Ok(Some(credential)) => {
                let already_tried = self
                    .static_credential
                    .as_ref()
                    .is_some_and(|s| last_error.is_some() && s.same_device(&credential));
                if !already_tried {
                    match self.try_credential(&credential).await {
                        Ok(token) => return Ok(token),
                        Err(e) => last_error = Some(e),
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Credential store lookup failed");
                if last_error.is_none() {
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or(AuthError::NoCredentials))
    }

    async fn persisted_credential(&self) -> Result<Option<Credential>, AuthError> {
        match &self.store {
            Some(store) => store
                .find_active_most_recently_used()
                .await
                .map_err(|e| AuthError::Store(e.to_string())),
            None => Ok(None),
        }
    }

    async fn try_credential(&self, credential: &Credential) -> Result<TokenState, AuthError> {
        match self.exchange.exchange_credentials(credential).await {
            Ok(token) => {
                info!(
                    account = %token.issued_account_id,
                    origin = ?credential.origin,
                    "Token issued from credentials"
                );
                if credential.origin == CredentialOrigin::Persisted {
                    if let Some(store) = &self.store {
                        if let Err(e) = store.mark_used(&credential.source_id).await {
                            warn!(error = %e, "Failed to stamp credential as used");
                        }
                    }
                }
                Ok(token)
            }
            Err(e) => {
                warn!(
                    origin = ?credential.origin,
                    subject = %credential.subject_id,
                    error = %e,
                    "Credential exchange failed"
                );
                Err(e)
            }
        }
    }

    fn settle(&self, generation: u64, result: &Result<TokenState, AuthError>) {
        let mut session = self.session.lock().unwrap();
        if session.generation != generation {
            debug!("Discarding exchange result after reset");
            return;
        }

        session.pending = None;
        match result {
            Ok(token) => {
                session.token = Some(token.clone());
                session.state = TokenManagerState::Ready;
                session.last_error = None;
            }
            Err(e) => {
                session.state = TokenManagerState::Failed;
                session.last_error = Some(e.clone());
            }
        }
    }
}

#[async_trait]
impl TokenProvider for TokenManager {
    async fn get_token(&self) -> Result<String, AuthError> {
        TokenManager::get_token(self).await
    }

    async fn refresh(&self) -> Result<String, AuthError> {
        TokenManager::refresh(self).await
    }
}
