//! # blobsync-db: SQLite Persistence for blobsync
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  blobsync (SqliteBlobStorage, SyncMetadataStore for Database)          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  blobsync-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌──────────────────┐    ┌────────────┐  │   │
//! │  │   │   Database    │    │   Repositories   │    │ Migrations │  │   │
//! │  │   │   (pool.rs)   │◄───│ BlobRepository   │    │ (embedded) │  │   │
//! │  │   │   SqlitePool  │    │ PeerBlobSyncRepo │    │            │  │   │
//! │  │   └───────────────┘    └──────────────────┘    └────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite file (WAL)                                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ```rust,ignore
//! use blobsync_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("blobsync.db")).await?;
//! db.blobs().upsert(&record).await?;
//! db.peer_blob_sync().set_uploaded_at("cloud", &record.key, Some(Utc::now())).await?;
//! ```

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

pub use error::{DbError, DbResult};
pub use migrations::MigrationStatus;
pub use pool::{Database, DbConfig, DbLocation};
pub use repository::blob::BlobRepository;
pub use repository::sync::PeerBlobSyncRepository;
