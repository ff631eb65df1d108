//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use esports_ingest::auth::TokenProvider;
use esports_ingest::clock::{Clock, ManualClock};
use esports_ingest::config::{
    Config, HttpConfig, RateLimitConfig, RetryConfig, SourceConfig, SyncConfig,
};
use esports_ingest::database::{RecordStore, SqliteDatabase};
use esports_ingest::error::AuthError;
use esports_ingest::jobs::{build_runners, JobContext, JobRunner};
use esports_ingest::sync::{
    HostRateLimiter, NoopSink, NotificationSink, RemoteClient, RetryManager, SyncOrchestrator,
};

/// Create an in-memory database for testing
pub async fn create_test_database() -> Arc<SqliteDatabase> {
    Arc::new(
        SqliteDatabase::in_memory()
            .await
            .expect("Failed to create test database"),
    )
}

/// Retry policy without waiting between attempts
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 2,
        initial_backoff_ms: 10,
        max_backoff_ms: 100,
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

/// Token provider returning fixed tokens and counting calls
#[derive(Default)]
pub struct StaticTokens {
    pub token: String,
    pub refreshed: String,
    pub refreshes: AtomicU32,
}

impl StaticTokens {
    pub fn new(token: &str, refreshed: &str) -> Self {
        Self {
            token: token.to_string(),
            refreshed: refreshed.to_string(),
            refreshes: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokens {
    async fn get_token(&self) -> Result<String, AuthError> {
        Ok(self.token.clone())
    }

    async fn refresh(&self) -> Result<String, AuthError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(self.refreshed.clone())
    }
}

/// Wiring shared by the end-to-end tests
pub struct TestHarness {
    pub database: Arc<SqliteDatabase>,
    pub clock: Arc<ManualClock>,
    pub limiter: Arc<HostRateLimiter>,
    pub ctx: JobContext,
}

impl TestHarness {
    /// Harness with the given limits and token provider
    pub async fn new(rate_limits: RateLimitConfig, tokens: Arc<dyn TokenProvider>) -> Self {
        Self::with_sink(rate_limits, tokens, Arc::new(NoopSink)).await
    }

    /// Harness with a custom notification sink
    pub async fn with_sink(
        rate_limits: RateLimitConfig,
        tokens: Arc<dyn TokenProvider>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let database = create_test_database().await;
        let clock = Arc::new(ManualClock::new());
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let limiter = Arc::new(HostRateLimiter::new(rate_limits, dyn_clock.clone()));
        let store: Arc<dyn RecordStore> = database.clone();

        let ctx = JobContext {
            store: store.clone(),
            client: Arc::new(
                RemoteClient::new(&HttpConfig::default(), limiter.clone())
                    .expect("Failed to build client"),
            ),
            tokens,
            orchestrator: Arc::new(SyncOrchestrator::new(
                store,
                limiter.clone(),
                RetryManager::with_clock(fast_retry(), dyn_clock.clone()),
                &SyncConfig::default(),
            )),
            sink,
            clock: dyn_clock,
        };

        Self {
            database,
            clock,
            limiter,
            ctx,
        }
    }

    /// Runner for a single source
    pub fn runner(&self, job: &str, source: SourceConfig) -> Arc<JobRunner> {
        let mut config = Config::default();
        config.sources.insert(job.to_string(), source);
        build_runners(&config, &self.ctx)
            .expect("Failed to build runners")
            .remove(0)
    }
}

/// Source pointed at a mock server
pub fn source_config(server: &MockServer) -> SourceConfig {
    SourceConfig {
        enabled: true,
        base_url: server.uri(),
        list_path: Some("/catalog".to_string()),
        detail_path: Some("/items/{id}".to_string()),
        interval_secs: 3600,
        deactivate_missing: false,
    }
}

/// Serve a single-page catalog
pub async fn mount_catalog(server: &MockServer, items: Value) {
    Mock::given(method("GET"))
        .and(path("/catalog"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": items })))
        .mount(server)
        .await;
}

/// Serve one detail document
pub async fn mount_detail(server: &MockServer, id: &str, status: u16, body: Value) {
    Mock::given(method("GET"))
        .and(path(format!("/items/{}", id)))
        .respond_with(ResponseTemplate::new(status).set_body_json(body))
        .mount(server)
        .await;
}
