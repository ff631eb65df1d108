//! SQLite implementation of the store traits
//!
//! This module provides a SQLite-based implementation of `RecordStore` and
//! `CredentialStore` using rusqlite and tokio-rusqlite for async operations.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;

use super::migrations::CREATE_SCHEMA;
use super::{CredentialStore, RecordStore};
use crate::error::DbError;
use crate::models::{
    Credential, EntityKind, FieldMap, JobRun, JobRunStatus, LocalRecord, RecordFilter,
    SecretMaterial, UpsertOutcome,
};

const RECORD_COLUMNS: &str =
    "kind, canonical_id, source, fields, source_updated_at, last_reconciled_at, active";

/// SQLite database implementation
pub struct SqliteDatabase {
    conn: Connection,
}

impl SqliteDatabase {
    /// Create a new SQLite database connection
    ///
    /// Use `:memory:` for in-memory database or a file path for persistent storage.
    pub async fn new(path: &str) -> Result<Self, DbError> {
        if path != ":memory:" {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| DbError::Connection(e.to_string()))?;
                }
            }
        }

        let conn = Connection::open(path).await?;

        conn.call(|conn| {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            conn.execute_batch(CREATE_SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// Create a new in-memory database (useful for testing)
    pub async fn in_memory() -> Result<Self, DbError> {
        Self::new(":memory:").await
    }
}

#[async_trait]
impl RecordStore for SqliteDatabase {
    async fn find_many(&self, filter: &RecordFilter) -> Result<Vec<LocalRecord>, DbError> {
        let (clause, params) = filter_clause(filter);
        let sql = format!(
            "SELECT {} FROM records{} ORDER BY kind, canonical_id",
            RECORD_COLUMNS, clause
        );

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let records = stmt
                    .query_map(rusqlite::params_from_iter(params.iter()), row_to_record)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await
            .map_err(Into::into)
    }

    async fn find_unique(
        &self,
        kind: EntityKind,
        id: &str,
    ) -> Result<Option<LocalRecord>, DbError> {
        let id = id.to_string();
        let sql = format!(
            "SELECT {} FROM records WHERE kind = ?1 AND canonical_id = ?2",
            RECORD_COLUMNS
        );

        self.conn
            .call(move |conn| {
                let record = conn
                    .query_row(&sql, rusqlite::params![kind.as_str(), id], row_to_record)
                    .optional()?;
                Ok(record)
            })
            .await
            .map_err(Into::into)
    }

    async fn upsert(
        &self,
        id: &str,
        create: &LocalRecord,
        update: &LocalRecord,
    ) -> Result<UpsertOutcome, DbError> {
        let id = id.to_string();
        let kind = create.kind;
        let create = RecordRow::from_record(create)?;
        let update = RecordRow::from_record(update)?;
        let now = format_datetime(&Utc::now());

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let exists = tx
                    .query_row(
                        "SELECT 1 FROM records WHERE kind = ?1 AND canonical_id = ?2",
                        rusqlite::params![kind.as_str(), id],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();

                let outcome = if exists {
                    tx.execute(
                        r#"
                        UPDATE records
                        SET fields = ?3, source_updated_at = ?4, last_reconciled_at = ?5, active = ?6
                        WHERE kind = ?1 AND canonical_id = ?2
                        "#,
                        rusqlite::params![
                            kind.as_str(),
                            id,
                            update.fields,
                            update.source_updated_at,
                            update.last_reconciled_at,
                            update.active
                        ],
                    )?;
                    UpsertOutcome::Updated
                } else {
                    tx.execute(
                        r#"
                        INSERT INTO records
                        (kind, canonical_id, source, fields, source_updated_at, last_reconciled_at, active, created_at)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                        "#,
                        rusqlite::params![
                            kind.as_str(),
                            id,
                            create.source,
                            create.fields,
                            create.source_updated_at,
                            create.last_reconciled_at,
                            create.active,
                            now
                        ],
                    )?;
                    UpsertOutcome::Created
                };

                tx.commit()?;
                Ok(outcome)
            })
            .await
            .map_err(Into::into)
    }

    async fn count(&self, filter: &RecordFilter) -> Result<u64, DbError> {
        let (clause, params) = filter_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM records{}", clause);

        self.conn
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    &sql,
                    rusqlite::params_from_iter(params.iter()),
                    |row| row.get(0),
                )?;
                Ok(count as u64)
            })
            .await
            .map_err(Into::into)
    }

    async fn link_alias(
        &self,
        kind: EntityKind,
        alias: &str,
        canonical_id: &str,
    ) -> Result<String, DbError> {
        let alias = alias.to_string();
        let canonical_id = canonical_id.to_string();
        let now = format_datetime(&Utc::now());

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT OR IGNORE INTO record_aliases (kind, alias, canonical_id, created_at)
                    VALUES (?1, ?2, ?3, ?4)
                    "#,
                    rusqlite::params![kind.as_str(), alias, canonical_id, now],
                )?;

                let bound: String = conn.query_row(
                    "SELECT canonical_id FROM record_aliases WHERE kind = ?1 AND alias = ?2",
                    rusqlite::params![kind.as_str(), alias],
                    |row| row.get(0),
                )?;
                Ok(bound)
            })
            .await
            .map_err(Into::into)
    }

    async fn aliases(&self, kind: EntityKind) -> Result<Vec<(String, String)>, DbError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT alias, canonical_id FROM record_aliases WHERE kind = ?1 ORDER BY alias",
                )?;
                let pairs = stmt
                    .query_map([kind.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(pairs)
            })
            .await
            .map_err(Into::into)
    }

    async fn mark_inactive(&self, kind: EntityKind, ids: &[String]) -> Result<u64, DbError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids = ids.to_vec();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut changed = 0u64;
                {
                    let mut stmt = tx.prepare(
                        "UPDATE records SET active = 0 WHERE kind = ?1 AND canonical_id = ?2 AND active = 1",
                    )?;
                    for id in &ids {
                        changed += stmt.execute(rusqlite::params![kind.as_str(), id])? as u64;
                    }
                }
                tx.commit()?;
                Ok(changed)
            })
            .await
            .map_err(Into::into)
    }

    async fn record_job_run(&self, run: &JobRun) -> Result<(), DbError> {
        let run = run.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO job_runs
                    (job, started_at, finished_at, status, created, updated, skipped, error_count, error_message)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                    "#,
                    rusqlite::params![
                        run.job,
                        format_datetime(&run.started_at),
                        format_datetime(&run.finished_at),
                        run.status.to_string(),
                        run.created as i64,
                        run.updated as i64,
                        run.skipped as i64,
                        run.error_count as i64,
                        run.error_message
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    async fn latest_job_run(&self, job: &str) -> Result<Option<JobRun>, DbError> {
        let job = job.to_string();

        self.conn
            .call(move |conn| {
                let run = conn
                    .query_row(
                        r#"
                        SELECT job, started_at, finished_at, status, created, updated, skipped, error_count, error_message
                        FROM job_runs
                        WHERE job = ?1
                        ORDER BY started_at DESC, id DESC
                        LIMIT 1
                        "#,
                        [&job],
                        |row| {
                            let status: String = row.get(3)?;
                            Ok(JobRun {
                                job: row.get(0)?,
                                started_at: required_datetime(row.get(1)?, 1)?,
                                finished_at: required_datetime(row.get(2)?, 2)?,
                                status: status.parse().unwrap_or(JobRunStatus::Failed),
                                created: row.get::<_, i64>(4)? as u64,
                                updated: row.get::<_, i64>(5)? as u64,
                                skipped: row.get::<_, i64>(6)? as u64,
                                error_count: row.get::<_, i64>(7)? as u64,
                                error_message: row.get(8)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(run)
            })
            .await
            .map_err(Into::into)
    }
}

#[async_trait]
impl CredentialStore for SqliteDatabase {
    async fn find_active_most_recently_used(&self) -> Result<Option<Credential>, DbError> {
        self.conn
            .call(|conn| {
                let credential = conn
                    .query_row(
                        r#"
                        SELECT id, subject_id, device_id, secret
                        FROM credentials
                        WHERE active = 1
                        ORDER BY COALESCE(last_used_at, created_at) DESC, id DESC
                        LIMIT 1
                        "#,
                        [],
                        |row| {
                            let id: i64 = row.get(0)?;
                            Ok(Credential::persisted(
                                id.to_string(),
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                                row.get::<_, String>(3)?,
                            ))
                        },
                    )
                    .optional()?;
                Ok(credential)
            })
            .await
            .map_err(Into::into)
    }

    async fn mark_used(&self, id: &str) -> Result<(), DbError> {
        let id: i64 = id
            .parse()
            .map_err(|_| DbError::ConstraintViolation(format!("invalid credential id: {}", id)))?;
        let now = format_datetime(&Utc::now());

        let changed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE credentials SET last_used_at = ?1 WHERE id = ?2",
                    rusqlite::params![now, id],
                )?;
                Ok(changed)
            })
            .await?;

        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    async fn upsert_credential(
        &self,
        subject_id: &str,
        material: &SecretMaterial,
    ) -> Result<String, DbError> {
        let subject_id = subject_id.to_string();
        let material = material.clone();
        let now = format_datetime(&Utc::now());

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "UPDATE credentials SET active = 0 WHERE subject_id = ?1",
                    [&subject_id],
                )?;
                tx.execute(
                    r#"
                    INSERT INTO credentials (subject_id, device_id, secret, active, created_at)
                    VALUES (?1, ?2, ?3, 1, ?4)
                    "#,
                    rusqlite::params![subject_id, material.device_id, material.secret, now],
                )?;
                let id = tx.last_insert_rowid();
                tx.commit()?;
                Ok(id.to_string())
            })
            .await
            .map_err(Into::into)
    }
}

/// Owned column values for one record write
struct RecordRow {
    source: String,
    fields: String,
    source_updated_at: Option<String>,
    last_reconciled_at: String,
    active: bool,
}

impl RecordRow {
    fn from_record(record: &LocalRecord) -> Result<Self, DbError> {
        Ok(Self {
            source: record.source.clone(),
            fields: serde_json::to_string(&record.fields)?,
            source_updated_at: record.source_updated_at.as_ref().map(format_datetime),
            last_reconciled_at: format_datetime(&record.last_reconciled_at),
            active: record.active,
        })
    }
}

/// Build a WHERE clause and its positional parameters
fn filter_clause(filter: &RecordFilter) -> (String, Vec<SqlValue>) {
    let mut conditions = Vec::new();
    let mut params = Vec::new();

    if let Some(kind) = filter.kind {
        params.push(SqlValue::Text(kind.as_str().to_string()));
        conditions.push(format!("kind = ?{}", params.len()));
    }

    if let Some(ids) = &filter.ids {
        if ids.is_empty() {
            conditions.push("0".to_string());
        } else {
            let placeholders: Vec<String> = ids
                .iter()
                .map(|id| {
                    params.push(SqlValue::Text(id.clone()));
                    format!("?{}", params.len())
                })
                .collect();
            conditions.push(format!("canonical_id IN ({})", placeholders.join(", ")));
        }
    }

    if filter.active_only {
        conditions.push("active = 1".to_string());
    }

    if conditions.is_empty() {
        (String::new(), params)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), params)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<LocalRecord> {
    let kind: String = row.get(0)?;
    let kind = kind.parse::<EntityKind>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Text, e.into())
    })?;

    let fields: String = row.get(3)?;
    let fields: FieldMap = serde_json::from_str(&fields)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

    Ok(LocalRecord {
        kind,
        canonical_id: row.get(1)?,
        source: row.get(2)?,
        fields,
        source_updated_at: parse_datetime(row.get::<_, Option<String>>(4)?),
        last_reconciled_at: required_datetime(row.get(5)?, 5)?,
        active: row.get(6)?,
    })
}

/// Fixed-width RFC 3339 so text ordering matches time ordering
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a datetime string to DateTime<Utc>
fn parse_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| {
                // Try parsing SQLite's datetime format
                chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|dt| dt.and_utc())
            })
    })
}

fn required_datetime(s: String, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_datetime(Some(s.clone())).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("invalid datetime: {}", s).into(),
        )
    })
}
