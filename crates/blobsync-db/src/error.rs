//! # Database Error Types
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  sqlx::Error / MigrateError                                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  DbError          pool and connection problems kept apart from          │
//! │       │           query failures                                        │
//! │       ▼                                                                 │
//! │  StorageError     Disconnected for the former, Backend for the rest    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use blobsync_core::StorageError;
use thiserror::Error;

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// The database file could not be opened or created.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The pool was closed with [`Database::close`](crate::Database::close).
    #[error("Database is closed")]
    Closed,

    /// Every pooled connection stayed busy past the acquire timeout.
    #[error("Connection pool exhausted")]
    PoolExhausted,

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// SQLite rejected a statement.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// A stored value did not decode into the expected Rust type.
    #[error("Corrupt row: {0}")]
    Decode(String),

    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    /// True if the pool itself is unusable, as opposed to one bad query.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            DbError::ConnectionFailed(_) | DbError::Closed | DbError::PoolExhausted
        )
    }
}

/// ## Error Mapping
/// ```text
/// sqlx::Error::Database                 → DbError::QueryFailed
/// sqlx::Error::ColumnDecode / Decode    → DbError::Decode
/// sqlx::Error::PoolTimedOut             → DbError::PoolExhausted
/// sqlx::Error::PoolClosed               → DbError::Closed
/// sqlx::Error::Io                       → DbError::ConnectionFailed
/// Other                                 → DbError::Internal
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => DbError::QueryFailed(db_err.message().to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                DbError::Decode(err.to_string())
            }
            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,
            sqlx::Error::PoolClosed => DbError::Closed,
            sqlx::Error::Io(io) => DbError::ConnectionFailed(io.to_string()),
            other => DbError::Internal(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

impl From<DbError> for StorageError {
    fn from(err: DbError) -> Self {
        if err.is_connection_error() {
            StorageError::Disconnected
        } else {
            StorageError::Backend(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_mapping() {
        assert_eq!(StorageError::from(DbError::PoolExhausted), StorageError::Disconnected);
        assert_eq!(StorageError::from(DbError::Closed), StorageError::Disconnected);
        assert!(matches!(
            StorageError::from(DbError::QueryFailed("syntax error".into())),
            StorageError::Backend(msg) if msg == "Query failed: syntax error"
        ));
    }

    #[test]
    fn test_sqlx_mapping() {
        assert!(matches!(DbError::from(sqlx::Error::PoolClosed), DbError::Closed));
        assert!(matches!(DbError::from(sqlx::Error::PoolTimedOut), DbError::PoolExhausted));
        assert!(!DbError::from(sqlx::Error::RowNotFound).is_connection_error());
    }
}
