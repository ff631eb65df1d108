//! Incremental synchronization infrastructure
//!
//! # Components
//!
//! - [`rate_limiter`]: per-host request spacing and throttling backoff
//! - [`http_client`]: status mapping, 429 handling and bearer retry
//! - [`retry`]: exponential backoff for transient item failures
//! - [`merge`]: gap-filling merge policy
//! - [`orchestrator`]: generic reconciliation loop over a [`SyncFamily`]
//! - [`scheduler`]: periodic and manual job triggering
//! - [`notify`]: best-effort job summaries
//!
//! # Example
//!
//! ```ignore
//! use esports_ingest::sync::{JobScope, StopSignal, SyncOrchestrator};
//!
//! let orchestrator = SyncOrchestrator::new(store, limiter, retry, &config.sync);
//! let stats = orchestrator.run(&family, &JobScope::All, &StopSignal::new()).await?;
//! println!("{}", stats.summary(family.name()));
//! ```

pub mod http_client;
pub mod merge;
pub mod notify;
pub mod orchestrator;
pub mod rate_limiter;
pub mod retry;
pub mod scheduler;

pub use http_client::RemoteClient;
pub use merge::{merge_fill_gaps, merge_upsert};
pub use notify::{sink_from_config, NoopSink, NotificationSink, WebhookSink};
pub use orchestrator::{
    CatalogPage, JobScope, LocalIndex, RemoteItem, StopSignal, SyncFamily, SyncOrchestrator,
    SyncTarget,
};
pub use rate_limiter::{host_key, HostRateLimiter};
pub use retry::RetryManager;
pub use scheduler::{JobScheduler, JobStatus, ManualTriggerHandle, ScheduledJob};
