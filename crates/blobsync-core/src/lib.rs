//! # blobsync-core: Pure Types for Blob Replication
//!
//! The vocabulary shared by the storage layer (`blobsync-db`) and the
//! replication engine (`blobsync`). Nothing here touches a disk or a socket.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   BlobFrontend ──► SyncCoordinator ──► PeerSync ×N                     │
//! │        │                  │                 │                           │
//! │        └──────────────────┴─────────────────┘                           │
//! │                           │ uses                                        │
//! │  ┌────────────────────────▼────────────────────────────────────────┐   │
//! │  │               ★ blobsync-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌────────────┐   ┌────────────┐   ┌────────────┐             │   │
//! │  │   │   types    │   │   state    │   │ validation │             │   │
//! │  │   │ BlobRecord │   │ SyncState  │   │ blob keys  │             │   │
//! │  │   │ ListedBlob │   │ BlobState  │   │ blob sizes │             │   │
//! │  │   └────────────┘   └────────────┘   └────────────┘             │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK                             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Blob records and listing entries
//! - [`state`] - Per-peer and per-blob sync state snapshots
//! - [`error`] - Storage and validation errors
//! - [`validation`] - Blob key and size checks
//!
//! ## Example Usage
//!
//! ```rust
//! use blobsync_core::{BlobRecord, SyncState};
//!
//! let record = BlobRecord::new("avatars/alice.png", vec![0u8; 16]).with_mime("image/png");
//! assert_eq!(record.size(), 16);
//!
//! let total = SyncState::merge([
//!     SyncState { uploading: 1, ..Default::default() },
//!     SyncState { downloading: 2, over_capacity: true, ..Default::default() },
//! ]);
//! assert_eq!(total.uploading, 1);
//! assert!(total.over_capacity);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod state;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{StorageError, StorageResult, ValidationError};
pub use state::{BlobState, SyncState};
pub use types::{BlobRecord, ListedBlob};

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Largest blob the frontend accepts unless reconfigured (100 MiB).
pub const DEFAULT_MAX_BLOB_SIZE: usize = 100 * 1024 * 1024;

/// Longest accepted blob key, in bytes.
///
/// Keys end up as SQLite primary keys and object-store paths; anything longer
/// is almost certainly a caller bug.
pub const MAX_BLOB_KEY_LEN: usize = 1024;
