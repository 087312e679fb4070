//! # Validation Module
//!
//! Checks applied before a blob enters local storage.
//!
//! ## Usage
//! ```rust
//! use blobsync_core::validation::{validate_blob_key, validate_blob_size};
//!
//! validate_blob_key("avatars/alice.png").unwrap();
//! validate_blob_size(512, 1024).unwrap();
//! assert!(validate_blob_size(2048, 1024).is_err());
//! ```

use crate::error::ValidationError;
use crate::MAX_BLOB_KEY_LEN;

/// Validates a blob key.
///
/// ## Rules
/// - Not empty
/// - At most [`MAX_BLOB_KEY_LEN`] bytes
/// - No control characters
pub fn validate_blob_key(key: &str) -> Result<(), ValidationError> {
    if key.is_empty() {
        return Err(ValidationError::EmptyKey);
    }

    if key.len() > MAX_BLOB_KEY_LEN {
        return Err(ValidationError::KeyTooLong {
            len: key.len(),
            max: MAX_BLOB_KEY_LEN,
        });
    }

    if key.chars().any(char::is_control) {
        return Err(ValidationError::InvalidKey(key.to_string()));
    }

    Ok(())
}

/// Validates a payload length against a maximum (inclusive).
pub fn validate_blob_size(size: usize, max: usize) -> Result<(), ValidationError> {
    if size > max {
        return Err(ValidationError::BlobTooLarge { size, max });
    }
    Ok(())
}
