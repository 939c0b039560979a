//! Represents the object currently occupying a key's slot.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One stored object, as seen in a directory listing.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    /// Logical key the object is stored under.
    pub key: String,

    /// File name on disk (`<key>_<timestamp>_<display name>`).
    pub stored_name: String,

    /// Client-provided filename, kept for display only.
    pub display_name: String,

    /// When the upload was committed.
    pub uploaded_at: DateTime<Utc>,

    /// Payload size in bytes.
    pub size_bytes: u64,
}

/// The payload of a fetched object together with what is needed to serve it.
#[derive(Clone, Debug)]
pub struct ObjectContent {
    pub object: StoredObject,
    pub content_type: &'static str,
    /// Hex MD5 of the payload.
    pub etag: String,
    pub bytes: Bytes,
}

/// Counts from a startup maintenance sweep.
#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Leftover temp files from interrupted uploads.
    pub orphaned_temp_files: usize,
    /// Superseded objects for keys that held more than one.
    pub stale_objects: usize,
}
