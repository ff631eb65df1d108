//! Periodic job scheduler
//!
//! Runs every registered job at its own interval with random jitter. Manual
//! runs go through [`ManualTriggerHandle`] and run on their own tasks. A
//! broadcast shutdown stops the timers and raises the shared [`StopSignal`]
//! so in-flight passes end after their current item. Run deadlines belong
//! to the job itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use super::orchestrator::{JobScope, StopSignal};
use crate::config::SchedulerSettings;
use crate::error::JobError;
use crate::models::JobStats;

/// Status of one scheduled job
#[derive(Debug, Clone, Default)]
pub struct JobStatus {
    /// When the last run finished
    pub last_run: Option<DateTime<Utc>>,
    /// Last run outcome
    pub last_result: Option<Result<JobStats, String>>,
    /// Estimated next run
    pub next_run: Option<DateTime<Utc>>,
    /// Whether a run is in progress
    pub in_progress: bool,
}

/// A job the scheduler can run
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    /// Job name
    fn name(&self) -> &str;

    /// Time between scheduled runs
    fn interval(&self) -> Duration;

    /// Run one pass
    async fn run_pass(&self, scope: &JobScope, stop: &StopSignal) -> Result<JobStats, JobError>;
}

struct ManualTrigger {
    job: String,
    scope: JobScope,
    response: oneshot::Sender<Result<JobStats, JobError>>,
}

/// Scheduler for ingestion jobs
pub struct JobScheduler {
    settings: SchedulerSettings,
    jobs: Vec<Arc<dyn ScheduledJob>>,
    status: Arc<RwLock<HashMap<String, JobStatus>>>,
    stop: StopSignal,
    shutdown_rx: broadcast::Receiver<()>,
    manual_rx: mpsc::Receiver<ManualTrigger>,
    manual_tx: mpsc::Sender<ManualTrigger>,
}

impl JobScheduler {
    /// Create a scheduler over `jobs`
    pub fn new(
        settings: SchedulerSettings,
        jobs: Vec<Arc<dyn ScheduledJob>>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let (manual_tx, manual_rx) = mpsc::channel(32);

        let status = jobs
            .iter()
            .map(|j| (j.name().to_string(), JobStatus::default()))
            .collect();

        Self {
            settings,
            jobs,
            status: Arc::new(RwLock::new(status)),
            stop: StopSignal::new(),
            shutdown_rx,
            manual_rx,
            manual_tx,
        }
    }

    /// Handle for triggering runs outside the schedule
    pub fn manual_trigger_handle(&self) -> ManualTriggerHandle {
        ManualTriggerHandle {
            tx: self.manual_tx.clone(),
        }
    }

    /// Shared status map, readable while the scheduler runs
    pub fn status_handle(&self) -> Arc<RwLock<HashMap<String, JobStatus>>> {
        self.status.clone()
    }

    /// Run until shutdown
    pub async fn run(mut self) {
        info!(jobs = self.jobs.len(), "Starting job scheduler");

        if self.settings.initial_delay_secs > 0 {
            debug!(
                delay_secs = self.settings.initial_delay_secs,
                "Waiting for initial delay"
            );
            tokio::time::sleep(Duration::from_secs(self.settings.initial_delay_secs)).await;
        }

        let mut handles = Vec::new();
        let (task_shutdown_tx, _) = broadcast::channel::<()>(1);

        for job in &self.jobs {
            let job = job.clone();
            let status = self.status.clone();
            let settings = self.settings.clone();
            let stop = self.stop.clone();
            let task_shutdown_rx = task_shutdown_tx.subscribe();

            handles.push(tokio::spawn(async move {
                Self::run_job_loop(job, status, settings, stop, task_shutdown_rx).await;
            }));
        }

        let mut manual_runs: Vec<JoinHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping job scheduler");
                    self.stop.stop();
                    let _ = task_shutdown_tx.send(());
                    break;
                }
                Some(request) = self.manual_rx.recv() => {
                    manual_runs.retain(|h| !h.is_finished());
                    manual_runs.push(self.spawn_manual_run(request));
                }
            }
        }

        for handle in handles.into_iter().chain(manual_runs) {
            let _ = handle.await;
        }

        info!("Job scheduler stopped");
    }

    async fn run_job_loop(
        job: Arc<dyn ScheduledJob>,
        status: Arc<RwLock<HashMap<String, JobStatus>>>,
        settings: SchedulerSettings,
        stop: StopSignal,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let name = job.name().to_string();
        let interval = job.interval();

        info!(job = %name, "Performing initial run");
        let _ = Self::perform_run(&job, &JobScope::All, &status, &stop).await;

        let jitter = random_jitter(settings.jitter_secs);
        let first_tick = Instant::now() + interval + Duration::from_secs(jitter);
        debug!(
            job = %name,
            interval_secs = interval.as_secs(),
            jitter_secs = jitter,
            "Scheduled next run"
        );

        let mut timer = interval_at(first_tick, interval);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(job = %name, "Job loop shutting down");
                    break;
                }
                _ = timer.tick() => {
                    let jitter = random_jitter(settings.jitter_secs);
                    if jitter > 0 {
                        tokio::time::sleep(Duration::from_secs(jitter)).await;
                    }

                    info!(job = %name, "Performing scheduled run");
                    let _ = Self::perform_run(&job, &JobScope::All, &status, &stop).await;
                }
            }
        }
    }

    async fn perform_run(
        job: &Arc<dyn ScheduledJob>,
        scope: &JobScope,
        status: &Arc<RwLock<HashMap<String, JobStatus>>>,
        stop: &StopSignal,
    ) -> Result<JobStats, JobError> {
        let name = job.name().to_string();

        {
            let mut map = status.write().await;
            if let Some(s) = map.get_mut(&name) {
                if s.in_progress {
                    warn!(job = %name, "Previous run still in progress, skipping");
                    return Err(JobError::InvalidRequest(format!("{} is already running", name)));
                }
                s.in_progress = true;
            }
        }

        let result = job.run_pass(scope, stop).await;

        let mut map = status.write().await;
        if let Some(s) = map.get_mut(&name) {
            s.in_progress = false;
            s.last_run = Some(Utc::now());
            s.last_result = Some(match &result {
                Ok(stats) => {
                    info!(job = %name, summary = %stats.summary(&name), "Job run completed");
                    Ok(stats.clone())
                }
                Err(err) => {
                    warn!(job = %name, error = %err, "Job run failed");
                    Err(err.to_string())
                }
            });
            s.next_run = chrono::Duration::from_std(job.interval())
                .ok()
                .map(|d| Utc::now() + d);
        }

        result
    }

    fn spawn_manual_run(&self, request: ManualTrigger) -> JoinHandle<()> {
        let job = self.jobs.iter().find(|j| j.name() == request.job).cloned();
        let status = self.status.clone();
        let stop = self.stop.clone();

        tokio::spawn(async move {
            let result = match job {
                Some(job) => {
                    info!(job = %request.job, scope = %request.scope, "Manual run triggered");
                    Self::perform_run(&job, &request.scope, &status, &stop).await
                }
                None => {
                    warn!(job = %request.job, "Manual run requested for unknown job");
                    Err(JobError::InvalidRequest(format!("unknown job: {}", request.job)))
                }
            };

            let _ = request.response.send(result);
        })
    }
}

fn random_jitter(max_secs: u64) -> u64 {
    if max_secs > 0 {
        rand::thread_rng().gen_range(0..max_secs)
    } else {
        0
    }
}

/// Handle for triggering runs manually
#[derive(Clone)]
pub struct ManualTriggerHandle {
    tx: mpsc::Sender<ManualTrigger>,
}

impl ManualTriggerHandle {
    /// Run `job` over `scope` and wait for its stats
    pub async fn trigger(&self, job: &str, scope: JobScope) -> Result<JobStats, JobError> {
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .send(ManualTrigger {
                job: job.to_string(),
                scope,
                response: response_tx,
            })
            .await
            .map_err(|_| JobError::InvalidRequest("scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| JobError::InvalidRequest("no response from scheduler".to_string()))?
    }
}
