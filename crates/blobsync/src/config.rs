//! # Sync Configuration
//!
//! Tunables for retry, reconciliation, state throttling, and the frontend
//! size guard.
//!
//! ## Load Order (later overrides earlier)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  1. Defaults (SyncConfig::default)                                     │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  2. sync.toml in the platform config dir (or an explicit path)         │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  3. BLOBSYNC_* environment variables                                   │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  4. validate()                                                          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example sync.toml
//! ```toml
//! [frontend]
//! max_blob_size = 104857600
//!
//! [download]
//! max_attempts = 5
//! readonly_max_attempts = 1
//! initial_backoff_ms = 1000
//! max_backoff_ms = 10000
//!
//! [upload]
//! loop_interval_secs = 15
//! direct_upload_threshold = 3
//!
//! [status]
//! throttle_ms = 1000
//!
//! [database]
//! path = "/var/lib/blobsync/blobsync.db"
//! max_connections = 5
//! ```

use std::path::PathBuf;
use std::time::Duration;

use blobsync_core::DEFAULT_MAX_BLOB_SIZE;
use blobsync_db::DbConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Frontend Settings
// =============================================================================

/// Settings for the frontend size guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendSettings {
    /// Largest blob accepted by `BlobFrontend::set`, in bytes.
    #[serde(default = "default_max_blob_size")]
    pub max_blob_size: usize,
}

fn default_max_blob_size() -> usize {
    DEFAULT_MAX_BLOB_SIZE
}

impl Default for FrontendSettings {
    fn default() -> Self {
        Self {
            max_blob_size: default_max_blob_size(),
        }
    }
}

// =============================================================================
// Download Settings
// =============================================================================

/// Retry policy for pulling a single blob from a peer.
///
/// The wait after attempt `n` is `min(initial * 2^(n-1), max)`; with the
/// defaults that is 1s, 2s, 4s, 8s across five attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSettings {
    /// Attempts against a writable remote.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Attempts against a read-only remote.
    #[serde(default = "default_readonly_max_attempts")]
    pub readonly_max_attempts: u32,

    /// First retry delay in milliseconds.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Retry delay ceiling in milliseconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_readonly_max_attempts() -> u32 {
    1
}
fn default_initial_backoff() -> u64 {
    1000
}
fn default_max_backoff() -> u64 {
    10_000
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            readonly_max_attempts: default_readonly_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl DownloadSettings {
    /// Attempt budget for a remote with the given read-only flag.
    pub fn attempts_for(&self, readonly: bool) -> u32 {
        if readonly {
            self.readonly_max_attempts
        } else {
            self.max_attempts
        }
    }

    /// First retry delay.
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Retry delay ceiling.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

// =============================================================================
// Upload Settings
// =============================================================================

/// Settings for the per-peer push loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSettings {
    /// Pause between reconciliation passes, in seconds.
    #[serde(default = "default_loop_interval")]
    pub loop_interval_secs: u64,

    /// At or below this many pending blobs, upload directly without listing
    /// the remote first.
    #[serde(default = "default_direct_upload_threshold")]
    pub direct_upload_threshold: usize,
}

fn default_loop_interval() -> u64 {
    15
}
fn default_direct_upload_threshold() -> usize {
    3
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            loop_interval_secs: default_loop_interval(),
            direct_upload_threshold: default_direct_upload_threshold(),
        }
    }
}

impl UploadSettings {
    /// Pause between reconciliation passes.
    pub fn loop_interval(&self) -> Duration {
        Duration::from_secs(self.loop_interval_secs)
    }
}

// =============================================================================
// Status Settings
// =============================================================================

/// Settings for observable state streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSettings {
    /// Minimum spacing between published snapshots, in milliseconds.
    #[serde(default = "default_throttle")]
    pub throttle_ms: u64,
}

fn default_throttle() -> u64 {
    1000
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            throttle_ms: default_throttle(),
        }
    }
}

impl StatusSettings {
    /// Minimum spacing between published snapshots.
    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }
}

// =============================================================================
// Database Settings
// =============================================================================

/// Location of the SQLite database backing the local store and watermarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Database file. Defaults to `blobsync.db` in the platform data dir.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: default_max_connections(),
        }
    }
}

// =============================================================================
// Main Config Structure
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub frontend: FrontendSettings,

    #[serde(default)]
    pub download: DownloadSettings,

    #[serde(default)]
    pub upload: UploadSettings,

    #[serde(default)]
    pub status: StatusSettings,

    #[serde(default)]
    pub database: DatabaseSettings,
}

impl SyncConfig {
    /// Builds the effective configuration: defaults, then the TOML file (if
    /// present), then `BLOBSYNC_*` environment variables.
    ///
    /// ## Arguments
    /// * `config_path` - Explicit file, or `None` for the platform default
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let path = config_path.or_else(Self::default_config_path);

        let mut config: SyncConfig = match path {
            Some(path) if path.is_file() => {
                info!(?path, "Reading sync config");
                toml::from_str(&std::fs::read_to_string(&path)?)?
            }
            Some(path) => {
                debug!(?path, "No sync config file, starting from defaults");
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Like [`load`](Self::load), falling back to defaults on any error.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        match Self::load(config_path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Unusable sync config, falling back to defaults");
                Self::default()
            }
        }
    }

    /// Parses and validates a TOML document, without env overrides.
    pub fn from_toml(contents: &str) -> SyncResult<Self> {
        let config: SyncConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.frontend.max_blob_size == 0 {
            return Err(SyncError::InvalidConfig(
                "max_blob_size must be greater than 0".into(),
            ));
        }

        if self.download.max_attempts == 0 || self.download.readonly_max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "download attempts must be at least 1".into(),
            ));
        }

        if self.download.initial_backoff_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "initial_backoff_ms must be greater than 0".into(),
            ));
        }

        if self.download.initial_backoff_ms > self.download.max_backoff_ms {
            return Err(SyncError::InvalidConfig(format!(
                "initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.download.initial_backoff_ms, self.download.max_backoff_ms
            )));
        }

        if self.upload.loop_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "loop_interval_secs must be greater than 0".into(),
            ));
        }

        if self.status.throttle_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "throttle_ms must be greater than 0".into(),
            ));
        }

        if self.database.max_connections == 0 {
            return Err(SyncError::InvalidConfig(
                "database max_connections must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(size) = std::env::var("BLOBSYNC_MAX_BLOB_SIZE") {
            match size.parse::<usize>() {
                Ok(s) => {
                    debug!(max_blob_size = s, "Overriding max blob size from environment");
                    self.frontend.max_blob_size = s;
                }
                Err(_) => warn!(value = %size, "Ignoring invalid BLOBSYNC_MAX_BLOB_SIZE"),
            }
        }

        if let Ok(attempts) = std::env::var("BLOBSYNC_DOWNLOAD_ATTEMPTS") {
            if let Ok(a) = attempts.parse::<u32>() {
                self.download.max_attempts = a;
            }
        }

        if let Ok(secs) = std::env::var("BLOBSYNC_UPLOAD_INTERVAL_SECS") {
            if let Ok(s) = secs.parse::<u64>() {
                debug!(secs = s, "Overriding upload loop interval from environment");
                self.upload.loop_interval_secs = s;
            }
        }

        if let Ok(ms) = std::env::var("BLOBSYNC_STATUS_THROTTLE_MS") {
            if let Ok(m) = ms.parse::<u64>() {
                self.status.throttle_ms = m;
            }
        }

        if let Ok(path) = std::env::var("BLOBSYNC_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = Some(PathBuf::from(path));
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "blobsync", "blobsync")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Resolved database path: explicit setting, else the platform data dir.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.database.path.clone().or_else(|| {
            directories::ProjectDirs::from("dev", "blobsync", "blobsync")
                .map(|dirs| dirs.data_dir().join("blobsync.db"))
        })
    }

    /// Pool configuration for [`blobsync_db::Database::new`].
    pub fn db_config(&self) -> SyncResult<DbConfig> {
        let path = self
            .database_path()
            .ok_or_else(|| SyncError::InvalidConfig("No database path available".into()))?;
        Ok(DbConfig::new(path).max_connections(self.database.max_connections))
    }
}
