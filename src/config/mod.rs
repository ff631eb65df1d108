//! Configuration management for esports-ingest
//!
//! This module handles loading, parsing, and validating application configuration
//! from YAML files and environment variables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Outbound HTTP settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Authenticated game-platform API
    #[serde(default)]
    pub api: ApiConfig,

    /// Per-host request spacing
    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    /// Per-item retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Orchestrator policy
    #[serde(default)]
    pub sync: SyncConfig,

    /// Periodic scheduling
    #[serde(default)]
    pub scheduler: SchedulerSettings,

    /// Catalog sources keyed by job name
    #[serde(default)]
    pub sources: HashMap<String, SourceConfig>,

    /// Job summary notifications
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(yaml);
        let config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables with prefix ESPORTS_INGEST_
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Ok(path) = std::env::var("ESPORTS_INGEST_DATABASE_PATH") {
            config.database.path = path;
        }
        if let Ok(level) = std::env::var("ESPORTS_INGEST_LOG_LEVEL") {
            config.logging.level = level;
        }

        if let Ok(url) = std::env::var("ESPORTS_INGEST_API_TOKEN_URL") {
            config.api.token_url = url;
        }
        if let Ok(id) = std::env::var("ESPORTS_INGEST_API_CLIENT_ID") {
            config.api.client_id = id;
        }
        if let Ok(secret) = std::env::var("ESPORTS_INGEST_API_CLIENT_SECRET") {
            config.api.client_secret = secret;
        }

        let subject = std::env::var("ESPORTS_INGEST_SUBJECT_ID").ok();
        let device = std::env::var("ESPORTS_INGEST_DEVICE_ID").ok();
        let secret = std::env::var("ESPORTS_INGEST_DEVICE_SECRET").ok();
        if let (Some(subject_id), Some(device_id), Some(secret)) = (subject, device, secret) {
            config.api.credentials = Some(StaticCredentialConfig {
                subject_id,
                device_id,
                secret,
            });
        }

        if let Ok(url) = std::env::var("ESPORTS_INGEST_NOTIFY_WEBHOOK_URL") {
            config.notify.webhook_url = Some(url);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, source) in &self.sources {
            if source.enabled && source.base_url.trim().is_empty() {
                return Err(ConfigError::MissingRequired(format!(
                    "sources.{}.base_url",
                    name
                )));
            }
            if source.interval_secs == 0 {
                return Err(ConfigError::InvalidValue(format!(
                    "sources.{}.interval_secs must be positive",
                    name
                )));
            }
        }

        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue(
                "retry.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }

        if self.sync.auth_failure_threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "sync.auth_failure_threshold must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Enabled sources, sorted by name for stable ordering
    pub fn enabled_sources(&self) -> Vec<(&str, &SourceConfig)> {
        let mut sources: Vec<_> = self
            .sources
            .iter()
            .filter(|(_, s)| s.enabled)
            .map(|(name, s)| (name.as_str(), s))
            .collect();
        sources.sort_by(|a, b| a.0.cmp(b.0));
        sources
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "data/esports.db".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (`json` or `pretty`)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Outbound HTTP settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpConfig {
    /// Per-request timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_http_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    concat!("esports-ingest/", env!("CARGO_PKG_VERSION")).to_string()
}

/// Authenticated API configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    /// OAuth token endpoint
    #[serde(default)]
    pub token_url: String,

    /// Session invalidation endpoint; `{token}` is replaced by the access token
    #[serde(default)]
    pub logout_url: Option<String>,

    /// Client id for the token endpoint's basic auth
    #[serde(default)]
    pub client_id: String,

    /// Client secret for the token endpoint's basic auth
    #[serde(default)]
    pub client_secret: String,

    /// Refresh this many seconds before expiry
    #[serde(default = "default_refresh_buffer")]
    pub refresh_buffer_secs: u64,

    /// Static device credentials, tried before the credential store
    #[serde(default)]
    pub credentials: Option<StaticCredentialConfig>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            token_url: String::new(),
            logout_url: None,
            client_id: String::new(),
            client_secret: String::new(),
            refresh_buffer_secs: default_refresh_buffer(),
            credentials: None,
        }
    }
}

fn default_refresh_buffer() -> u64 {
    300
}

/// Device credentials supplied through configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaticCredentialConfig {
    /// Account the device credentials belong to
    pub subject_id: String,
    /// Device id
    pub device_id: String,
    /// Device secret
    pub secret: String,
}

/// Per-host request spacing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Spacing for hosts without an explicit entry (0 = unbounded)
    #[serde(default)]
    pub default_min_interval_ms: u64,

    /// Random extra delay added to each slot, up to this many milliseconds
    #[serde(default)]
    pub jitter_ms: u64,

    /// First penalty delay when throttled without a Retry-After hint
    #[serde(default = "default_base_backoff")]
    pub base_backoff_ms: u64,

    /// Upper bound on any penalty delay
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Host-specific spacing in milliseconds
    #[serde(default)]
    pub hosts: HashMap<String, u64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_min_interval_ms: 0,
            jitter_ms: 0,
            base_backoff_ms: default_base_backoff(),
            max_backoff_secs: default_max_backoff_secs(),
            hosts: HashMap::new(),
        }
    }
}

fn default_base_backoff() -> u64 {
    1000
}

fn default_max_backoff_secs() -> u64 {
    60
}

/// Retry configuration for remote item fetches
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff duration in milliseconds
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration in milliseconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Whether to add jitter to backoff
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    1000
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

/// Orchestrator policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    /// Consecutive auth failures that abort a pass
    #[serde(default = "default_auth_failure_threshold")]
    pub auth_failure_threshold: u32,

    /// Records older than this are re-fetched
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auth_failure_threshold: default_auth_failure_threshold(),
            stale_after_secs: default_stale_after(),
        }
    }
}

fn default_auth_failure_threshold() -> u32 {
    5
}

fn default_stale_after() -> u64 {
    86_400
}

/// Periodic scheduling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerSettings {
    /// Delay before the first run of every job
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    /// Random delay added to each run
    #[serde(default = "default_scheduler_jitter")]
    pub jitter_secs: u64,

    /// Limit on a single job run, scheduled or manual; 0 disables
    ///
    /// An overrunning pass ends after its current item and is recorded as
    /// failed.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay(),
            jitter_secs: default_scheduler_jitter(),
            job_timeout_secs: default_job_timeout(),
        }
    }
}

fn default_initial_delay() -> u64 {
    5
}

fn default_scheduler_jitter() -> u64 {
    60
}

fn default_job_timeout() -> u64 {
    3600
}

/// One catalog source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    /// Whether this job is enabled
    #[serde(default = "default_source_enabled")]
    pub enabled: bool,

    /// Base URL of the source
    pub base_url: String,

    /// Listing path relative to base_url
    #[serde(default)]
    pub list_path: Option<String>,

    /// Detail path template; `{id}` is replaced by the remote locator
    #[serde(default)]
    pub detail_path: Option<String>,

    /// Seconds between scheduled runs
    #[serde(default = "default_source_interval")]
    pub interval_secs: u64,

    /// Mark records missing from a complete listing as inactive
    #[serde(default)]
    pub deactivate_missing: bool,
}

fn default_source_enabled() -> bool {
    true
}

fn default_source_interval() -> u64 {
    21_600
}

/// Notification sink configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NotifyConfig {
    /// Webhook receiving a `{"content": "..."}` JSON body
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Configuration error types
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read configuration file: {0}")]
    FileRead(String),

    /// Error parsing configuration
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

/// Expand environment variables in a string
///
/// Supports `${VAR_NAME}` syntax
fn expand_env_vars(input: &str) -> String {
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .expect("Invalid regex pattern for environment variable expansion");

    re.replace_all(input, |caps: &regex_lite::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}
