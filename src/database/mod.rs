//! Database layer for esports-ingest
//!
//! The orchestrator and token manager only see the two traits defined here.
//! `SqliteDatabase` implements both.

pub mod migrations;
pub mod sqlite;

pub use sqlite::SqliteDatabase;

use async_trait::async_trait;

use crate::error::DbError;
use crate::models::{
    Credential, EntityKind, JobRun, LocalRecord, RecordFilter, SecretMaterial, UpsertOutcome,
};

/// Persistent store for reconciled entities
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All records matching the filter
    async fn find_many(&self, filter: &RecordFilter) -> Result<Vec<LocalRecord>, DbError>;

    /// One record by kind and canonical id
    async fn find_unique(
        &self,
        kind: EntityKind,
        id: &str,
    ) -> Result<Option<LocalRecord>, DbError>;

    /// Insert `create` if `id` is absent, otherwise overwrite with `update`
    async fn upsert(
        &self,
        id: &str,
        create: &LocalRecord,
        update: &LocalRecord,
    ) -> Result<UpsertOutcome, DbError>;

    /// Number of records matching the filter
    async fn count(&self, filter: &RecordFilter) -> Result<u64, DbError>;

    /// Bind `alias` to `canonical_id` unless already bound
    ///
    /// Returns the canonical id the alias is bound to after the call.
    async fn link_alias(
        &self,
        kind: EntityKind,
        alias: &str,
        canonical_id: &str,
    ) -> Result<String, DbError>;

    /// All alias bindings of one kind as `(alias, canonical_id)` pairs
    async fn aliases(&self, kind: EntityKind) -> Result<Vec<(String, String)>, DbError>;

    /// Flag records as no longer present upstream
    async fn mark_inactive(&self, kind: EntityKind, ids: &[String]) -> Result<u64, DbError>;

    /// Append a job run to the history
    async fn record_job_run(&self, run: &JobRun) -> Result<(), DbError>;

    /// Most recent run of a job
    async fn latest_job_run(&self, job: &str) -> Result<Option<JobRun>, DbError>;
}

/// Persistent store for API device credentials
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// The active credential used most recently
    async fn find_active_most_recently_used(&self) -> Result<Option<Credential>, DbError>;

    /// Stamp a credential's last-used time
    async fn mark_used(&self, id: &str) -> Result<(), DbError>;

    /// Store new device credentials for a subject, superseding older ones
    ///
    /// Returns the id of the new credential.
    async fn upsert_credential(
        &self,
        subject_id: &str,
        material: &SecretMaterial,
    ) -> Result<String, DbError>;
}
