//! Ingestion jobs
//!
//! A [`JobRunner`] wraps one [`SyncFamily`] with the shared orchestrator,
//! records a [`JobRun`] for every pass and forwards the summary to the
//! notification sink. [`build_runners`] wires one runner per enabled source.
//!
//! - [`source`]: paginated JSON catalog client
//! - [`families`]: organizations, players, tournaments, earnings, transfers

pub mod families;
pub mod source;

pub use families::{descriptor, CatalogFamily, FamilyDescriptor, ALL_FAMILIES};
pub use source::JsonCatalogSource;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::auth::TokenProvider;
use crate::clock::Clock;
use crate::config::Config;
use crate::database::RecordStore;
use crate::error::JobError;
use crate::models::{JobRun, JobStats, RecordFilter};
use crate::sync::{
    JobScope, NotificationSink, RemoteClient, ScheduledJob, StopSignal, SyncFamily,
    SyncOrchestrator,
};

/// Outcome of one job run
#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    /// Job name
    pub job: String,
    /// Pass tally
    pub stats: JobStats,
    /// Records of this family in the store after the pass
    pub total_records: u64,
    /// Active records of this family after the pass
    pub active_records: u64,
}

impl JobReport {
    /// One-line summary including store totals
    pub fn summary(&self) -> String {
        format!(
            "{} total={} active={}",
            self.stats.summary(&self.job),
            self.total_records,
            self.active_records
        )
    }
}

/// One schedulable ingestion job
pub struct JobRunner {
    family: Arc<dyn SyncFamily>,
    orchestrator: Arc<SyncOrchestrator>,
    store: Arc<dyn RecordStore>,
    sink: Arc<dyn NotificationSink>,
    interval: Duration,
    deadline: Option<Duration>,
}

impl JobRunner {
    /// Create a runner
    pub fn new(
        family: Arc<dyn SyncFamily>,
        orchestrator: Arc<SyncOrchestrator>,
        store: Arc<dyn RecordStore>,
        sink: Arc<dyn NotificationSink>,
        interval: Duration,
    ) -> Self {
        Self {
            family,
            orchestrator,
            store,
            sink,
            interval,
            deadline: None,
        }
    }

    /// Stop passes that run longer than `deadline`
    ///
    /// The pass ends after its current item and the run is recorded as a
    /// timeout failure.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Job name
    pub fn name(&self) -> &str {
        self.family.name()
    }

    /// Run one pass, persist its history and notify
    pub async fn run(&self, scope: &JobScope, stop: &StopSignal) -> Result<JobReport, JobError> {
        let job = self.family.name().to_string();
        let started_at = Utc::now();

        let stats = match self.run_pass_with_deadline(scope, stop).await {
            Ok(stats) => stats,
            Err(e) => {
                error!(job = %job, error = %e, "Job run failed");
                if let Err(store_err) = self
                    .store
                    .record_job_run(&JobRun::failed(&job, started_at, e.to_string()))
                    .await
                {
                    warn!(job = %job, error = %store_err, "Could not record failed job run");
                }
                self.sink.notify(&format!("{}: failed: {}", job, e));
                return Err(e);
            }
        };

        self.store
            .record_job_run(&JobRun::completed(&job, started_at, &stats))
            .await?;

        let kind = self.family.kind();
        let report = JobReport {
            total_records: self.store.count(&RecordFilter::kind(kind)).await?,
            active_records: self.store.count(&RecordFilter::kind(kind).active()).await?,
            job,
            stats,
        };

        for item in report.stats.errors.iter().take(10) {
            warn!(job = %report.job, item = %item.item_id, error = %item.message, "Item error");
        }
        info!(
            job = %report.job,
            total = report.total_records,
            active = report.active_records,
            "Job run completed"
        );
        self.sink.notify(&report.summary());

        Ok(report)
    }

    async fn run_pass_with_deadline(
        &self,
        scope: &JobScope,
        stop: &StopSignal,
    ) -> Result<JobStats, JobError> {
        let Some(deadline) = self.deadline else {
            return self.orchestrator.run(self.family.as_ref(), scope, stop).await;
        };

        let run_stop = stop.child();
        let pass = self.orchestrator.run(self.family.as_ref(), scope, &run_stop);
        tokio::pin!(pass);

        match tokio::time::timeout(deadline, &mut pass).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    job = %self.family.name(),
                    deadline_secs = deadline.as_secs(),
                    "Job run over its deadline, stopping after the current item"
                );
                run_stop.stop();
                let partial = pass.await?;
                info!(
                    job = %self.family.name(),
                    summary = %partial.summary(self.family.name()),
                    "Partial pass before timeout"
                );
                Err(JobError::Timeout(deadline.as_secs()))
            }
        }
    }
}

#[async_trait]
impl ScheduledJob for JobRunner {
    fn name(&self) -> &str {
        self.family.name()
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_pass(&self, scope: &JobScope, stop: &StopSignal) -> Result<JobStats, JobError> {
        self.run(scope, stop).await.map(|report| report.stats)
    }
}

/// Shared infrastructure every runner is built from
#[derive(Clone)]
pub struct JobContext {
    /// Record store
    pub store: Arc<dyn RecordStore>,
    /// HTTP client shared by every source
    pub client: Arc<RemoteClient>,
    /// Bearer tokens for authenticated families
    pub tokens: Arc<dyn TokenProvider>,
    /// Reconciliation loop
    pub orchestrator: Arc<SyncOrchestrator>,
    /// Summary sink
    pub sink: Arc<dyn NotificationSink>,
    /// Time source for staleness
    pub clock: Arc<dyn Clock>,
}

/// One runner per enabled source, in dependency order
pub fn build_runners(config: &Config, ctx: &JobContext) -> Result<Vec<Arc<JobRunner>>, JobError> {
    let enabled = config.enabled_sources();

    if let Some((unknown, _)) = enabled.iter().find(|(name, _)| descriptor(name).is_none()) {
        return Err(JobError::InvalidRequest(format!(
            "unknown source: {} (expected one of {})",
            unknown,
            ALL_FAMILIES
                .iter()
                .map(|d| d.name)
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    let stale_after = chrono::Duration::seconds(config.sync.stale_after_secs as i64);
    let deadline = (config.scheduler.job_timeout_secs > 0)
        .then(|| Duration::from_secs(config.scheduler.job_timeout_secs));
    let mut runners = Vec::new();

    for desc in ALL_FAMILIES {
        let Some((_, source_config)) = enabled.iter().find(|(name, _)| *name == desc.name)
        else {
            continue;
        };

        let tokens = desc.authenticated.then(|| ctx.tokens.clone());
        let source = JsonCatalogSource::new(source_config, ctx.client.clone(), tokens)
            .map_err(|e| JobError::InvalidRequest(format!("{}: {}", desc.name, e)))?;

        let family = CatalogFamily::new(
            desc,
            source,
            ctx.store.clone(),
            ctx.clock.clone(),
            stale_after,
        )
        .with_deactivate_missing(source_config.deactivate_missing);

        let mut runner = JobRunner::new(
            Arc::new(family),
            ctx.orchestrator.clone(),
            ctx.store.clone(),
            ctx.sink.clone(),
            Duration::from_secs(source_config.interval_secs),
        );
        if let Some(deadline) = deadline {
            runner = runner.with_deadline(deadline);
        }
        runners.push(Arc::new(runner));
    }

    Ok(runners)
}
