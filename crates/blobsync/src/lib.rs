//! # blobsync: Blob Replication Engine
//!
//! Keeps a local blob store converged with any number of remote peers while
//! the application keeps reading and writing through a single frontend.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Replication Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                         BlobFrontend                              │  │
//! │  │  per-key lock • max blob size guard • detached uploads           │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │  ┌────────────────────────────▼─────────────────────────────────────┐  │
//! │  │                       SyncCoordinator                             │  │
//! │  │  fan-out to peers • aggregate state • start / stop upload loops  │  │
//! │  └──────────┬─────────────────────┬─────────────────────┬───────────┘  │
//! │             ▼                     ▼                     ▼               │
//! │  ┌────────────────────┐  ┌────────────────────┐  ┌────────────────┐    │
//! │  │ PeerSync "cloud"   │  │ PeerSync "mirror"  │  │ PeerSync ...   │    │
//! │  │ retry + backoff    │  │                    │  │                │    │
//! │  │ upload watermark   │  │                    │  │                │    │
//! │  │ PeerSyncStatus     │  │                    │  │                │    │
//! │  └─────────┬──────────┘  └─────────┬──────────┘  └────────────────┘    │
//! │            ▼                       ▼                                    │
//! │     remote BlobStorage      remote BlobStorage                          │
//! │                                                                         │
//! │  SHARED BY ALL PEERS:                                                  │
//! │  • local BlobStorage (SqliteBlobStorage or MemoryBlobStorage)          │
//! │  • SyncMetadataStore (upload watermark per peer and blob)              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`frontend`] - `BlobFrontend`, what the application calls
//! - [`coordinator`] - `SyncCoordinator` and its builder
//! - [`peer`] - `PeerSync`, replication with one remote
//! - [`status`] - `PeerSyncStatus`, observable per-peer state
//! - [`storage`] - `BlobStorage` / `SyncMetadataStore` and their backends
//! - [`connection`] - Connection state handle exposed by stores
//! - [`config`] - Configuration loading
//! - [`error`] - Error types
//! - [`singleflight`], [`lock`], [`throttle`] - Concurrency building blocks
//!
//! ## Example
//! ```rust,ignore
//! let config = SyncConfig::load(None)?;
//! let db = Database::new(config.db_config()?).await?;
//! db.run_migrations().await?;
//!
//! let local = Arc::new(SqliteBlobStorage::new(db.clone()));
//! let sync = SyncCoordinator::builder(local.clone(), Arc::new(db))
//!     .remote("cloud", cloud_store)
//!     .config(&config)
//!     .build()?;
//! sync.start();
//!
//! let frontend = BlobFrontend::with_config(local, sync, &config);
//! frontend.set(BlobRecord::new("avatars/alice.png", bytes)).await?;
//! ```

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod frontend;
pub mod lock;
pub mod peer;
pub mod singleflight;
pub mod status;
pub mod storage;
pub mod throttle;

#[cfg(test)]
mod test_util;

// Re-export commonly used types
pub use config::SyncConfig;
pub use connection::{ConnectionHandle, ConnectionState};
pub use coordinator::{SyncCoordinator, SyncCoordinatorBuilder};
pub use error::{SyncError, SyncResult};
pub use frontend::{BlobFrontend, ListenerId};
pub use peer::{PeerSettings, PeerSync};
pub use status::{PeerSyncStatus, StatusEvent};
pub use storage::{
    BlobStorage, MemoryBlobStorage, MemorySyncMetadata, SqliteBlobStorage, SyncMetadataStore,
};

pub use blobsync_core::{BlobRecord, BlobState, ListedBlob, StorageError, SyncState};
