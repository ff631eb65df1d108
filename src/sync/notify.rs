//! Job summary notifications
//!
//! Delivery is best-effort. A failing or slow webhook never fails or delays
//! the job that produced the summary. Callers about to exit use
//! [`NotificationSink::flush`] so queued deliveries are not dropped with the
//! runtime.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::{HttpConfig, NotifyConfig};

/// Receiver of one-line job summaries
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Hand off a summary; must not block
    fn notify(&self, summary: &str);

    /// Wait up to `timeout` for handed-off summaries to be delivered
    async fn flush(&self, _timeout: Duration) {}
}

/// Sink that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl NotificationSink for NoopSink {
    fn notify(&self, summary: &str) {
        debug!(summary = summary, "Notification sink disabled");
    }
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    content: &'a str,
}

/// Posts `{"content": summary}` to a webhook on a background task
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: Client,
    url: String,
    pending: Arc<Mutex<JoinSet<()>>>,
}

impl WebhookSink {
    /// Create a sink for `url`
    pub fn new(url: impl Into<String>, http: &HttpConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(http.timeout_secs))
            .user_agent(http.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            pending: Arc::new(Mutex::new(JoinSet::new())),
        })
    }

    /// POST the summary and wait for the response
    pub async fn deliver(&self, summary: &str) -> Result<(), reqwest::Error> {
        post_summary(&self.client, &self.url, summary).await
    }

    /// Deliveries handed off and not yet reaped
    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

async fn post_summary(client: &Client, url: &str, summary: &str) -> Result<(), reqwest::Error> {
    client
        .post(url)
        .json(&WebhookBody { content: summary })
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn notify(&self, summary: &str) {
        let client = self.client.clone();
        let url = self.url.clone();
        let summary = summary.to_string();
        // Requires a tokio runtime; outside one the summary is only logged
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(summary = %summary, "No runtime for webhook notification");
                return;
            }
        };

        let mut pending = self.pending.lock().unwrap();
        while pending.try_join_next().is_some() {}
        pending.spawn_on(
            async move {
                if let Err(e) = post_summary(&client, &url, &summary).await {
                    warn!(url = %url, error = %e, "Webhook notification failed");
                }
            },
            &handle,
        );
    }

    async fn flush(&self, timeout: Duration) {
        let mut pending = std::mem::take(&mut *self.pending.lock().unwrap());
        if pending.is_empty() {
            return;
        }

        let waiting = pending.len();
        let drained = tokio::time::timeout(timeout, async {
            while pending.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                url = %self.url,
                pending = waiting,
                "Webhook notifications still in flight at exit, dropping them"
            );
        }
    }
}

/// Sink for the configured notify section
pub fn sink_from_config(
    notify: &NotifyConfig,
    http: &HttpConfig,
) -> Box<dyn NotificationSink> {
    match notify.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) {
        Some(url) => match WebhookSink::new(url, http) {
            Ok(sink) => Box::new(sink),
            Err(e) => {
                warn!(error = %e, "Could not build webhook client, notifications disabled");
                Box::new(NoopSink)
            }
        },
        None => Box::new(NoopSink),
    }
}
