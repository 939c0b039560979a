//! Data models for the image slot store.
//!
//! Nothing here is persisted on its own: every value is derived from the
//! physical file names and file metadata in the storage directory, and
//! serialized as JSON by the handlers via `serde`.

pub mod object;
