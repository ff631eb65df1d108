//! Job statistics and run history

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::UpsertOutcome;

/// One failed item in a pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    /// Canonical id of the failed target
    pub item_id: String,
    /// Failure description
    pub message: String,
}

/// Tally of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    /// Records created
    pub created: u64,
    /// Records updated
    pub updated: u64,
    /// Targets skipped as fresh
    pub skipped: u64,
    /// Per-item failures in encounter order
    pub errors: Vec<ItemError>,
}

impl JobStats {
    /// Count an upsert result
    pub fn record_outcome(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Created => self.created += 1,
            UpsertOutcome::Updated => self.updated += 1,
        }
    }

    /// Count a skipped target
    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    /// Append a failed item
    pub fn record_error(&mut self, item_id: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ItemError {
            item_id: item_id.into(),
            message: message.into(),
        });
    }

    /// Targets that reached the store
    pub fn written(&self) -> u64 {
        self.created + self.updated
    }

    /// One-line tally for logs and notifications
    pub fn summary(&self, job: &str) -> String {
        format!(
            "{}: created={} updated={} skipped={} errors={}",
            job,
            self.created,
            self.updated,
            self.skipped,
            self.errors.len()
        )
    }
}

/// Outcome of a stored job run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    /// Pass finished, possibly with item errors
    Success,
    /// Pass aborted
    Failed,
}

impl std::fmt::Display for JobRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobRunStatus::Success => write!(f, "success"),
            JobRunStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for JobRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(JobRunStatus::Success),
            "failed" => Ok(JobRunStatus::Failed),
            other => Err(format!("unknown job run status: {}", other)),
        }
    }
}

/// Persisted history of one job run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRun {
    /// Job name
    pub job: String,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run ended
    pub finished_at: DateTime<Utc>,
    /// Outcome
    pub status: JobRunStatus,
    /// Records created
    pub created: u64,
    /// Records updated
    pub updated: u64,
    /// Targets skipped
    pub skipped: u64,
    /// Item errors
    pub error_count: u64,
    /// Fatal error, if the run aborted
    pub error_message: Option<String>,
}

impl JobRun {
    /// A completed run
    pub fn completed(job: impl Into<String>, started_at: DateTime<Utc>, stats: &JobStats) -> Self {
        Self {
            job: job.into(),
            started_at,
            finished_at: Utc::now(),
            status: JobRunStatus::Success,
            created: stats.created,
            updated: stats.updated,
            skipped: stats.skipped,
            error_count: stats.errors.len() as u64,
            error_message: None,
        }
    }

    /// An aborted run
    pub fn failed(
        job: impl Into<String>,
        started_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            job: job.into(),
            started_at,
            finished_at: Utc::now(),
            status: JobRunStatus::Failed,
            created: 0,
            updated: 0,
            skipped: 0,
            error_count: 0,
            error_message: Some(error.into()),
        }
    }
}
