//! # Storage Interfaces
//!
//! The engine is written against two traits and never against a concrete
//! backend:
//!
//! - [`BlobStorage`] - a keyed blob store (the local store, or a remote peer)
//! - [`SyncMetadataStore`] - the per-peer upload watermark
//!
//! ## Provided Backends
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   BlobStorage                        SyncMetadataStore                  │
//! │   ├── MemoryBlobStorage  (memory)    ├── MemorySyncMetadata  (memory)   │
//! │   └── SqliteBlobStorage  (sqlite)    └── blobsync_db::Database (sqlite) │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Remote backends (object stores, HTTP services) implement [`BlobStorage`]
//! outside this crate. They must surface quota exhaustion as
//! [`StorageError::OverCapacity`](blobsync_core::StorageError::OverCapacity)
//! and per-blob rejections as
//! [`StorageError::OverSize`](blobsync_core::StorageError::OverSize).

use std::fmt::Debug;

use async_trait::async_trait;
use blobsync_core::{BlobRecord, ListedBlob, StorageResult};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionHandle;

pub mod memory;
pub mod sqlite;

pub use memory::{MemoryBlobStorage, MemorySyncMetadata};
pub use sqlite::SqliteBlobStorage;

// =============================================================================
// BlobStorage
// =============================================================================

/// A keyed blob store.
///
/// Implementations must be safe to call concurrently. `get` and `set` take a
/// cancellation token; a backend that cannot abort mid-flight may ignore it,
/// the engine checks it again around every call.
#[async_trait]
pub trait BlobStorage: Send + Sync + Debug {
    /// Read-only stores are never uploaded to and get a single download
    /// attempt.
    fn is_readonly(&self) -> bool {
        false
    }

    /// Connection state of the backend.
    fn connection(&self) -> &ConnectionHandle;

    /// Fetches a blob; `Ok(None)` when absent.
    async fn get(&self, key: &str, cancel: &CancellationToken)
        -> StorageResult<Option<BlobRecord>>;

    /// Stores a blob, replacing any previous value under the same key.
    async fn set(&self, record: &BlobRecord, cancel: &CancellationToken) -> StorageResult<()>;

    /// Lists blobs, optionally only those whose key starts with `prefix`.
    async fn list(&self, prefix: Option<&str>) -> StorageResult<Vec<ListedBlob>>;

    /// Deletes a blob. Non-permanent deletes may be undone until
    /// [`release`](Self::release).
    async fn delete(&self, key: &str, permanently: bool) -> StorageResult<()>;

    /// Purges soft-deleted blobs.
    async fn release(&self) -> StorageResult<()> {
        Ok(())
    }
}

// =============================================================================
// SyncMetadataStore
// =============================================================================

/// Durable per-`(peer, key)` upload watermark.
///
/// `None` means "not known to be on the peer": never uploaded, or an upload
/// started and did not finish.
#[async_trait]
pub trait SyncMetadataStore: Send + Sync + Debug {
    async fn get_blob_uploaded_at(
        &self,
        peer: &str,
        key: &str,
    ) -> StorageResult<Option<DateTime<Utc>>>;

    async fn set_blob_uploaded_at(
        &self,
        peer: &str,
        key: &str,
        uploaded_at: Option<DateTime<Utc>>,
    ) -> StorageResult<()>;
}
