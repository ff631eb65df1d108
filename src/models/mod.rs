//! Domain models for esports-ingest
//!
//! This module contains the core domain models used throughout the application.

pub mod credential;
pub mod job;
pub mod record;

// Re-export commonly used types
pub use credential::{Credential, CredentialOrigin, SecretMaterial, TokenInfo, TokenState};
pub use job::{ItemError, JobRun, JobRunStatus, JobStats};
pub use record::{is_empty_value, EntityKind, FieldMap, LocalRecord, RecordFilter, UpsertOutcome};
