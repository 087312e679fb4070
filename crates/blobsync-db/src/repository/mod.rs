//! # Repository Module
//!
//! One repository per table. Each holds a cloned pool handle, so they are
//! cheap to create per call site (`db.blobs()`, `db.peer_blob_sync()`).

pub mod blob;
pub mod sync;
