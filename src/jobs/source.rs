//! Paginated JSON catalog source
//!
//! Listing: `GET {base_url}{list_path}?cursor=<token>` returning
//! `{"items": [...], "next": "<token>" | null}`. Each item carries at least an
//! `id`; `slug`, `updated_at` and a parent reference are optional.
//!
//! Detail: `GET {base_url}{detail_path}` with `{id}` replaced by the
//! percent-encoded remote id. A `null` or `{}` body means the source has no
//! detail for that entity.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::auth::TokenProvider;
use crate::config::SourceConfig;
use crate::error::SyncError;
use crate::sync::{host_key, RemoteClient};

/// Listing path used when the source leaves it unset
pub const DEFAULT_LIST_PATH: &str = "/";

/// Detail path used when the source leaves it unset
pub const DEFAULT_DETAIL_PATH: &str = "/{id}";

/// One listing entry
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ListingItem {
    /// Remote id
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// Stable human-facing key, used as the canonical id when present
    #[serde(default)]
    pub slug: Option<String>,
    /// Last modification advertised by the listing
    #[serde(default, alias = "updatedAt", alias = "last_modified")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Owning organization slug
    #[serde(default, alias = "org", alias = "team")]
    pub parent: Option<String>,
}

/// One listing page
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ListingPage {
    /// Entries on this page
    #[serde(default)]
    pub items: Vec<ListingItem>,
    /// Continuation token
    #[serde(default)]
    pub next: Option<String>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) if !s.trim().is_empty() => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or number id, got {}",
            other
        ))),
    }
}

/// JSON catalog endpoint for one job
pub struct JsonCatalogSource {
    base_url: String,
    list_path: String,
    detail_path: String,
    client: Arc<RemoteClient>,
    tokens: Option<Arc<dyn TokenProvider>>,
}

impl JsonCatalogSource {
    /// Create a source from its configuration
    ///
    /// Pass `tokens` for sources that need a bearer token.
    pub fn new(
        config: &SourceConfig,
        client: Arc<RemoteClient>,
        tokens: Option<Arc<dyn TokenProvider>>,
    ) -> Result<Self, SyncError> {
        Url::parse(&config.base_url)
            .map_err(|e| SyncError::InvalidData(format!("invalid base_url {}: {}", config.base_url, e)))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            list_path: config
                .list_path
                .clone()
                .unwrap_or_else(|| DEFAULT_LIST_PATH.to_string()),
            detail_path: config
                .detail_path
                .clone()
                .unwrap_or_else(|| DEFAULT_DETAIL_PATH.to_string()),
            client,
            tokens,
        })
    }

    /// Rate-limit bucket for this source
    pub fn host_key(&self) -> String {
        host_key(&self.base_url)
    }

    /// Whether requests carry a bearer token
    pub fn is_authenticated(&self) -> bool {
        self.tokens.is_some()
    }

    /// URL of one listing page
    pub fn list_url(&self, cursor: Option<&str>) -> Result<String, SyncError> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, self.list_path))
            .map_err(|e| SyncError::InvalidData(e.to_string()))?;
        if let Some(cursor) = cursor {
            url.query_pairs_mut().append_pair("cursor", cursor);
        }
        Ok(url.into())
    }

    /// URL of one detail document
    pub fn detail_url(&self, remote_id: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(remote_id.as_bytes()).collect();
        format!("{}{}", self.base_url, self.detail_path.replace("{id}", &encoded))
    }

    /// Fetch one listing page
    pub async fn list(&self, cursor: Option<&str>) -> Result<ListingPage, SyncError> {
        let url = self.list_url(cursor)?;
        let mut page: ListingPage = self.get(&url).await?;
        if page.next.as_deref().is_some_and(|n| n.trim().is_empty()) {
            page.next = None;
        }
        debug!(url = %url, items = page.items.len(), has_next = page.next.is_some(), "Listing page fetched");
        Ok(page)
    }

    /// Fetch one detail document
    pub async fn detail(&self, remote_id: &str) -> Result<Option<Value>, SyncError> {
        let value: Value = self.get(&self.detail_url(remote_id)).await?;
        match &value {
            Value::Null => Ok(None),
            Value::Object(map) if map.is_empty() => Ok(None),
            Value::Object(_) => Ok(Some(value)),
            other => Err(SyncError::InvalidData(format!(
                "expected an object for {}, got {}",
                remote_id,
                type_name(other)
            ))),
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, SyncError> {
        match &self.tokens {
            Some(tokens) => self.client.get_json_authed(url, tokens.as_ref()).await,
            None => self.client.get_json(url).await,
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
