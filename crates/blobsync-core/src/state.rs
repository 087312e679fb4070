//! # Sync State Snapshots
//!
//! Counters and flags the UI renders while replication runs.
//!
//! ## Aggregation Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   SyncState (per peer)          merged across peers                     │
//! │   ────────────────────          ───────────────────                     │
//! │   uploading     (count)   ──►   sum                                     │
//! │   downloading   (count)   ──►   sum                                     │
//! │   error         (count)   ──►   sum                                     │
//! │   over_capacity (flag)    ──►   any                                     │
//! │                                                                         │
//! │   BlobState (per key)                                                   │
//! │   ───────────────────                                                   │
//! │   uploading / downloading / over_size  ──►   any                        │
//! │   error_message                        ──►   first peer that has one    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! With zero peers both merges yield the all-zero / all-false default.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

// =============================================================================
// SyncState
// =============================================================================

/// Replication progress for one peer, or summed across all peers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SyncState {
    /// Blobs queued for upload or currently uploading.
    pub uploading: usize,

    /// Blobs queued for download or currently downloading.
    pub downloading: usize,

    /// Blobs whose last transfer failed.
    pub error: usize,

    /// The remote reported that it is out of space.
    pub over_capacity: bool,
}

impl SyncState {
    /// Sums counters and ORs the capacity flag.
    pub fn merge(states: impl IntoIterator<Item = SyncState>) -> SyncState {
        states
            .into_iter()
            .fold(SyncState::default(), |acc, s| SyncState {
                uploading: acc.uploading + s.uploading,
                downloading: acc.downloading + s.downloading,
                error: acc.error + s.error,
                over_capacity: acc.over_capacity || s.over_capacity,
            })
    }

    /// True when nothing is queued or in flight.
    pub fn is_idle(&self) -> bool {
        self.uploading == 0 && self.downloading == 0
    }
}

// =============================================================================
// BlobState
// =============================================================================

/// Replication state of a single blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct BlobState {
    /// Queued for upload or uploading.
    pub uploading: bool,

    /// Queued for download or downloading.
    pub downloading: bool,

    /// A remote refused the blob because of its size.
    pub over_size: bool,

    /// Message of the last failed transfer, if any.
    pub error_message: Option<String>,
}

impl BlobState {
    /// ORs the flags; the first non-empty error message wins.
    pub fn merge(states: impl IntoIterator<Item = BlobState>) -> BlobState {
        states.into_iter().fold(BlobState::default(), |acc, s| BlobState {
            uploading: acc.uploading || s.uploading,
            downloading: acc.downloading || s.downloading,
            over_size: acc.over_size || s.over_size,
            error_message: acc.error_message.or(s.error_message),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_state_merge() {
        let merged = SyncState::merge([
            SyncState {
                uploading: 2,
                downloading: 0,
                error: 1,
                over_capacity: false,
            },
            SyncState {
                uploading: 1,
                downloading: 4,
                error: 0,
                over_capacity: true,
            },
        ]);

        assert_eq!(merged.uploading, 3);
        assert_eq!(merged.downloading, 4);
        assert_eq!(merged.error, 1);
        assert!(merged.over_capacity);
        assert!(!merged.is_idle());
    }

    #[test]
    fn test_merge_of_nothing_is_default() {
        assert_eq!(SyncState::merge(Vec::new()), SyncState::default());
        assert_eq!(BlobState::merge(Vec::new()), BlobState::default());
        assert!(SyncState::default().is_idle());
    }

    #[test]
    fn test_blob_state_first_error_wins() {
        let merged = BlobState::merge([
            BlobState {
                uploading: true,
                ..Default::default()
            },
            BlobState {
                error_message: Some("first".into()),
                ..Default::default()
            },
            BlobState {
                over_size: true,
                error_message: Some("second".into()),
                ..Default::default()
            },
        ]);

        assert!(merged.uploading);
        assert!(!merged.downloading);
        assert!(merged.over_size);
        assert_eq!(merged.error_message.as_deref(), Some("first"));
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(SyncState {
            over_capacity: true,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(json["overCapacity"], true);
    }
}
