//! # Blob Types
//!
//! The unit of replication is a [`BlobRecord`]: an opaque key plus bytes.
//! Listings return [`ListedBlob`] entries, which carry metadata only.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

// =============================================================================
// BlobRecord
// =============================================================================

/// A content blob addressed by an opaque string key.
///
/// `data` is a [`Bytes`] so the same payload can be handed to several peers
/// without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRecord {
    /// Opaque key. The engine never derives or parses it.
    pub key: String,

    /// Blob payload.
    pub data: Bytes,

    /// Optional MIME type.
    pub mime: Option<String>,

    /// Optional creation timestamp.
    pub created_at: Option<DateTime<Utc>>,
}

impl BlobRecord {
    /// Creates a record with no MIME type and no timestamp.
    ///
    /// ## Example
    /// ```rust
    /// use blobsync_core::BlobRecord;
    ///
    /// let record = BlobRecord::new("doc/1", "hello");
    /// assert_eq!(record.size(), 5);
    /// ```
    pub fn new(key: impl Into<String>, data: impl Into<Bytes>) -> Self {
        BlobRecord {
            key: key.into(),
            data: data.into(),
            mime: None,
            created_at: None,
        }
    }

    /// Sets the MIME type.
    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    /// Sets the creation timestamp.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Payload length in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Listing entry describing this record.
    pub fn listing(&self) -> ListedBlob {
        ListedBlob {
            key: self.key.clone(),
            size: self.data.len() as u64,
            mime: self.mime.clone(),
            created_at: self.created_at,
        }
    }
}

// =============================================================================
// ListedBlob
// =============================================================================

/// One entry of a storage listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ListedBlob {
    /// Blob key.
    pub key: String,

    /// Content length in bytes.
    #[ts(type = "number")]
    pub size: u64,

    /// MIME type, if known.
    pub mime: Option<String>,

    /// Creation timestamp, if known.
    #[ts(as = "Option<String>")]
    pub created_at: Option<DateTime<Utc>>,
}
