//! # Error Types
//!
//! Errors shared by every storage backend and by the validation helpers.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  blobsync-core errors (this file)                                      │
//! │  ├── StorageError     - What a BlobStorage backend reports             │
//! │  └── ValidationError  - Rejected keys and sizes                        │
//! │                                                                         │
//! │  blobsync-db errors (separate crate)                                   │
//! │  └── DbError          - SQLite failures, mapped into StorageError      │
//! │                                                                         │
//! │  blobsync errors (engine crate)                                        │
//! │  └── SyncError        - What callers of the engine see                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Two remote failures are special: `OverCapacity` and `OverSize` change how
//! the engine schedules future uploads, so backends must report them as these
//! variants rather than as an opaque `Backend` message.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

// =============================================================================
// Storage Error
// =============================================================================

/// Failures reported by a blob storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The remote account has no space left.
    ///
    /// ## When This Occurs
    /// - Quota exhausted on the remote side
    ///
    /// The engine stops bulk uploads to that peer until a later upload
    /// succeeds.
    #[error("Remote storage over capacity")]
    OverCapacity,

    /// The remote refuses this particular blob because of its size.
    ///
    /// Sticky per key: bulk reconciliation skips such blobs from then on.
    #[error("Blob size too large")]
    OverSize,

    /// Write attempted against a read-only store.
    #[error("Storage is read-only")]
    Readonly,

    /// The blob does not exist (only for operations that require it).
    #[error("Blob not found: {0}")]
    NotFound(String),

    /// The backend's connection is down.
    #[error("Storage disconnected")]
    Disconnected,

    /// The caller's cancellation signal fired.
    #[error("Operation cancelled")]
    Cancelled,

    /// Any other backend failure.
    #[error("{0}")]
    Backend(String),
}

impl StorageError {
    /// Creates a backend error from anything printable.
    pub fn backend(msg: impl Into<String>) -> Self {
        StorageError::Backend(msg.into())
    }

    /// Returns true if this is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StorageError::Cancelled)
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Blob key is empty.
    #[error("Blob key cannot be empty")]
    EmptyKey,

    /// Blob key is longer than [`crate::MAX_BLOB_KEY_LEN`].
    #[error("Blob key too long: {len} bytes (max {max})")]
    KeyTooLong { len: usize, max: usize },

    /// Blob key contains a control character.
    #[error("Blob key contains control characters: {0:?}")]
    InvalidKey(String),

    /// Blob payload exceeds the configured maximum.
    #[error("Blob size exceeds the maximum limit: {size} bytes (max {max})")]
    BlobTooLarge { size: usize, max: usize },
}
