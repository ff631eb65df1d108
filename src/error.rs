//! Error types for esports-ingest
//!
//! Every layer has its own error enum. All of them use `thiserror`.
//! `ErrorClass` maps remote failures onto the retry/skip/abort taxonomy
//! the orchestrator acts on.

use thiserror::Error;

/// Credential and token lifecycle errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AuthError {
    /// No credential source yielded a credential
    #[error("No credentials available")]
    NoCredentials,

    /// Credentials rejected as invalid or expired; terminal until regenerated
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Exchange rejected with 401
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Exchange rejected with 403, typically a locked subject
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Transport or protocol failure while talking to the token endpoint
    #[error("Token exchange failed: {0}")]
    Exchange(String),

    /// The credential store could not be read
    #[error("Credential store error: {0}")]
    Store(String),

    /// A freshly issued token was already inside the refresh window
    #[error("Issued token expires too soon")]
    TokenExpired,
}

/// Remote fetch errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    /// Network timeout
    #[error("Network timeout")]
    NetworkTimeout,

    /// Connection refused
    #[error("Connection refused")]
    ConnectionRefused,

    /// Rate limited by upstream
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// Non-success HTTP status
    #[error("Server error: HTTP {0}")]
    ServerError(u16),

    /// Response could not be parsed into the expected structure
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Remote returned nothing for an item
    #[error("Empty result: {0}")]
    Empty(String),

    /// Resource not found
    #[error("Resource not found")]
    NotFound,

    /// 401 from the remote API
    #[error("Unauthorized")]
    Unauthorized,

    /// 403 from the remote API
    #[error("Forbidden")]
    Forbidden,

    /// Bearer token could not be obtained
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Generic network error
    #[error("Network error: {0}")]
    Network(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DbError {
    /// SQLite error
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection-level failure from the async wrapper
    #[error("Database connection error: {0}")]
    Connection(String),

    /// Stored JSON could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Record not found
    #[error("Record not found")]
    NotFound,

    /// Constraint violation
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),
}

impl From<tokio_rusqlite::Error> for DbError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::Rusqlite(e) => DbError::Sqlite(e),
            other => DbError::Connection(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

/// Errors that abort a whole job pass
#[derive(Debug, Error)]
pub enum JobError {
    /// The remote catalog listing could not be read
    #[error("Catalog unavailable: {0}")]
    CatalogUnavailable(SyncError),

    /// The local store failed
    #[error("Store unavailable: {0}")]
    Store(#[from] DbError),

    /// Too many consecutive items failed authentication
    #[error("Aborted after {0} consecutive authentication failures")]
    AuthFailuresExceeded(u32),

    /// The pass exceeded its time budget
    #[error("Job timed out after {0} seconds")]
    Timeout(u64),

    /// Unknown job or scope
    #[error("Invalid job request: {0}")]
    InvalidRequest(String),
}

/// How the orchestrator treats a failed item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff, then count as an item error
    Transient,
    /// Already refreshed and retried once; counts toward the auth abort threshold
    Auth,
    /// Count and skip for this pass
    Permanent,
}

/// Trait for determining if an error is retryable
pub trait RetryableError {
    /// Returns true if the error is retryable
    fn is_retryable(&self) -> bool;
}

impl SyncError {
    /// Classify this error for the orchestrator
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::NetworkTimeout
            | SyncError::ConnectionRefused
            | SyncError::RateLimited(_)
            | SyncError::Network(_) => ErrorClass::Transient,
            SyncError::ServerError(code) if *code >= 500 => ErrorClass::Transient,

            SyncError::Unauthorized | SyncError::Forbidden | SyncError::Auth(_) => {
                ErrorClass::Auth
            }

            SyncError::ServerError(_)
            | SyncError::InvalidData(_)
            | SyncError::Empty(_)
            | SyncError::NotFound => ErrorClass::Permanent,
        }
    }
}

impl RetryableError for SyncError {
    fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: Error message formatting
    #[test]
    fn test_auth_error_messages() {
        assert_eq!(AuthError::NoCredentials.to_string(), "No credentials available");
        assert_eq!(
            AuthError::InvalidCredentials("expired device auth".to_string()).to_string(),
            "Invalid credentials: expired device auth"
        );
        assert_eq!(
            AuthError::Forbidden("account locked".to_string()).to_string(),
            "Forbidden: account locked"
        );
    }

    // Test 2: SyncError messages with parameters
    #[test]
    fn test_sync_error_messages() {
        assert_eq!(SyncError::NetworkTimeout.to_string(), "Network timeout");
        assert_eq!(
            SyncError::RateLimited(60).to_string(),
            "Rate limited, retry after 60 seconds"
        );
        assert_eq!(
            SyncError::ServerError(503).to_string(),
            "Server error: HTTP 503"
        );
        assert_eq!(
            SyncError::Auth(AuthError::NoCredentials).to_string(),
            "Authentication error: No credentials available"
        );
    }

    // Test 3: Classification drives retry
    #[test]
    fn test_sync_error_retryable() {
        assert!(SyncError::NetworkTimeout.is_retryable());
        assert!(SyncError::ConnectionRefused.is_retryable());
        assert!(SyncError::RateLimited(30).is_retryable());
        assert!(SyncError::ServerError(502).is_retryable());
        assert!(SyncError::Network("connection reset".to_string()).is_retryable());

        assert!(!SyncError::InvalidData("bad format".to_string()).is_retryable());
        assert!(!SyncError::Empty("no rows".to_string()).is_retryable());
        assert!(!SyncError::NotFound.is_retryable());
        assert!(!SyncError::Unauthorized.is_retryable());
        assert!(!SyncError::ServerError(404).is_retryable());
    }

    // Test 4: Auth errors are their own class
    #[test]
    fn test_auth_class() {
        assert_eq!(SyncError::Unauthorized.class(), ErrorClass::Auth);
        assert_eq!(SyncError::Forbidden.class(), ErrorClass::Auth);
        assert_eq!(
            SyncError::Auth(AuthError::TokenExpired).class(),
            ErrorClass::Auth
        );
        assert_eq!(SyncError::ServerError(410).class(), ErrorClass::Permanent);
    }

    // Test 5: JobError wraps store failures
    #[test]
    fn test_job_error_from_db_error() {
        let job_err: JobError = DbError::NotFound.into();
        assert!(matches!(job_err, JobError::Store(DbError::NotFound)));
        assert_eq!(job_err.to_string(), "Store unavailable: Record not found");
    }

    // Test 6: DbError from rusqlite::Error
    #[test]
    fn test_db_error_from_sqlite() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let db_err: DbError = sqlite_err.into();
        assert!(matches!(db_err, DbError::Sqlite(_)));
    }

    // Test 7: Catalog failures keep the underlying cause
    #[test]
    fn test_catalog_unavailable_message() {
        let err = JobError::CatalogUnavailable(SyncError::ServerError(500));
        assert_eq!(err.to_string(), "Catalog unavailable: Server error: HTTP 500");
    }
}
