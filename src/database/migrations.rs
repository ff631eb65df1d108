//! Database migrations for esports-ingest
//!
//! This module contains SQL migrations for the SQLite database schema.

/// SQL statement to create the initial database schema
pub const CREATE_SCHEMA: &str = r#"
-- Reconciled entities, one row per (kind, canonical id)
CREATE TABLE IF NOT EXISTS records (
    kind TEXT NOT NULL,
    canonical_id TEXT NOT NULL,
    source TEXT NOT NULL,
    fields TEXT NOT NULL DEFAULT '{}',
    source_updated_at TEXT,
    last_reconciled_at TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    PRIMARY KEY (kind, canonical_id)
);

CREATE INDEX IF NOT EXISTS idx_records_reconciled ON records(kind, last_reconciled_at);

-- First-writer mapping from source-specific keys to canonical ids
CREATE TABLE IF NOT EXISTS record_aliases (
    kind TEXT NOT NULL,
    alias TEXT NOT NULL,
    canonical_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (kind, alias)
);

-- Device credentials for the authenticated API
CREATE TABLE IF NOT EXISTS credentials (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subject_id TEXT NOT NULL,
    device_id TEXT NOT NULL,
    secret TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    last_used_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_credentials_subject ON credentials(subject_id, active);

-- Job run history
CREATE TABLE IF NOT EXISTS job_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    status TEXT NOT NULL,
    created INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0,
    skipped INTEGER NOT NULL DEFAULT 0,
    error_count INTEGER NOT NULL DEFAULT 0,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_job_runs_job ON job_runs(job, started_at DESC);
"#;
