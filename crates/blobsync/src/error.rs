//! # Sync Error Types
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │    Storage      │  │     Frontend            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Storage(..)    │  │  BlobTooLarge           │ │
//! │  │  ConfigLoad     │  │  Database       │  │  Validation             │ │
//! │  │  ConfigSave     │  │                 │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                             │
//! │  │  Coordination   │  │    Lifecycle    │                             │
//! │  │                 │  │                 │                             │
//! │  │  UnknownPeer    │  │  Cancelled      │                             │
//! │  │  DuplicatePeer  │  │  TaskFailed     │                             │
//! │  └─────────────────┘  └─────────────────┘                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `StorageError::Cancelled` never appears wrapped: it converts straight into
//! [`SyncError::Cancelled`] so callers only have one variant to match.

use blobsync_core::{StorageError, ValidationError};
use thiserror::Error;

use crate::singleflight::FlightError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all replication failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// A storage backend failed.
    #[error(transparent)]
    Storage(StorageError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    // =========================================================================
    // Frontend Errors
    // =========================================================================
    /// Blob rejected by the frontend's size guard.
    #[error("Blob size exceeds the maximum limit: {size} bytes (max {max})")]
    BlobTooLarge { size: usize, max: usize },

    /// Key or payload failed validation.
    #[error("Validation error: {0}")]
    Validation(ValidationError),

    // =========================================================================
    // Coordination Errors
    // =========================================================================
    /// No peer is registered under this id.
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// Two remotes were registered under the same id.
    #[error("Duplicate peer id: {0}")]
    DuplicatePeer(String),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// The caller's cancellation signal fired.
    #[error("Operation cancelled")]
    Cancelled,

    /// A shared transfer task panicked or was aborted.
    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Cancelled => SyncError::Cancelled,
            other => SyncError::Storage(other),
        }
    }
}

impl From<ValidationError> for SyncError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::BlobTooLarge { size, max } => SyncError::BlobTooLarge { size, max },
            other => SyncError::Validation(other),
        }
    }
}

impl From<blobsync_db::DbError> for SyncError {
    fn from(err: blobsync_db::DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<Cancelled> for SyncError {
    fn from(_: Cancelled) -> Self {
        SyncError::Cancelled
    }
}

impl From<FlightError> for SyncError {
    fn from(err: FlightError) -> Self {
        SyncError::TaskFailed(err.0)
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Cancellation Marker
// =============================================================================

/// Cloneable cancellation outcome.
///
/// Shared in-flight operations hand the same result to every waiter, so the
/// result type must be `Clone`; `SyncError` is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Operation cancelled")]
pub struct Cancelled;

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if this error is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
                | SyncError::DuplicatePeer(_)
        )
    }

    /// The storage error behind this failure, if any.
    pub fn storage_error(&self) -> Option<&StorageError> {
        match self {
            SyncError::Storage(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_cancellation_is_flattened() {
        let err: SyncError = StorageError::Cancelled.into();
        assert!(err.is_cancelled());
        assert!(err.storage_error().is_none());

        let err: SyncError = StorageError::OverCapacity.into();
        assert_eq!(err.storage_error(), Some(&StorageError::OverCapacity));
        assert_eq!(err.to_string(), "Remote storage over capacity");
    }

    #[test]
    fn test_size_validation_maps_to_blob_too_large() {
        let err: SyncError = ValidationError::BlobTooLarge { size: 11, max: 10 }.into();
        assert!(matches!(err, SyncError::BlobTooLarge { size: 11, max: 10 }));

        let err: SyncError = ValidationError::EmptyKey.into();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn test_error_categories() {
        let err: SyncError = FlightError("task 7 panicked".into()).into();
        assert!(matches!(&err, SyncError::TaskFailed(reason) if reason == "task 7 panicked"));
        assert!(!err.is_cancelled());
        assert!(SyncError::InvalidConfig("x".into()).is_config_error());
        assert!(!SyncError::UnknownPeer("x".into()).is_config_error());
    }
}
