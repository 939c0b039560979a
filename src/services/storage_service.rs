//! src/services/storage_service.rs
//!
//! StorageService — a single-slot image store on local disk. Each key holds at
//! most one object, kept as one file in a flat directory and named by
//! [`naming`]. There is no metadata database and no in-memory index: every
//! operation works from a fresh directory listing, so the store carries no
//! state across restarts.
//!
//! Replacing an object is write-then-clean: the new payload is spooled to a
//! hidden temp file, renamed onto its final name, and only then are older
//! objects for the same key removed. Cleanup is best-effort; anything it
//! misses is removed by the next store for that key, by `delete_all`, or by
//! the startup `sweep`.

use crate::{
    models::object::{ObjectContent, StoredObject, SweepReport},
    services::naming,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, pin_mut, stream};
use std::{
    collections::{BTreeSet, HashMap},
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicI64, Ordering},
    },
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::Mutex as AsyncMutex,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upload cap used when none is configured (10 MB).
pub const DEFAULT_MAX_OBJECT_BYTES: u64 = 10_000_000;

/// Prefix of in-flight upload files. Hidden names are never objects.
const TEMP_PREFIX: &str = ".tmp-";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid key `{key}`: {reason}")]
    InvalidKey { key: String, reason: &'static str },
    #[error("media type `{0}` is not an image")]
    InvalidMediaType(String),
    #[error("payload exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: u64 },
    #[error("delete credential rejected")]
    Unauthorized,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Tunables fixed at construction time.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Hard cap on a single payload.
    pub max_object_bytes: u64,

    /// Shared secret for `delete_all`. `None` disables bulk deletion.
    pub delete_secret: Option<String>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_object_bytes: DEFAULT_MAX_OBJECT_BYTES,
            delete_secret: None,
        }
    }
}

/// Single-slot store over one directory.
///
/// Cheap to clone; clones share the timestamp clock and the per-key commit
/// locks, so handlers can each hold their own copy.
#[derive(Clone)]
pub struct StorageService {
    /// Directory holding one file per stored object.
    pub base_path: PathBuf,

    options: Arc<StoreOptions>,
    clock: Arc<MonotonicClock>,
    key_locks: Arc<KeyLocks>,
}

impl StorageService {
    pub fn new(base_path: impl Into<PathBuf>, options: StoreOptions) -> Self {
        Self {
            base_path: base_path.into(),
            options: Arc::new(options),
            clock: Arc::new(MonotonicClock::default()),
            key_locks: Arc::new(KeyLocks::default()),
        }
    }

    /// Create the storage directory if it is missing. Idempotent.
    pub async fn ensure_storage_dir(&self) -> StoreResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        Ok(())
    }

    /// Store an in-memory payload under `key`, replacing whatever the key
    /// held before. The HTTP layer streams through [`Self::store_stream`].
    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn store(
        &self,
        key: &str,
        content_type: &str,
        original_name: &str,
        payload: Bytes,
    ) -> StoreResult<StoredObject> {
        validate_upload(key, content_type)?;
        let limit = self.options.max_object_bytes;
        if payload.len() as u64 > limit {
            return Err(StoreError::PayloadTooLarge { limit });
        }

        let chunks = stream::iter([Ok::<_, io::Error>(payload)]);
        self.store_stream(key, content_type, original_name, chunks)
            .await
    }

    /// Stream a payload to disk and make it the current object for `key`.
    ///
    /// - Validates the key and that `content_type` is `image/*`.
    /// - Spools bytes to a hidden temp file, enforcing the size cap while
    ///   streaming, then fsyncs it.
    /// - Under the key's commit lock: picks a timestamp newer than anything
    ///   stored for the key, renames the temp file onto its final name and
    ///   removes the superseded objects.
    ///
    /// The temp file is removed on every failure path, including when the
    /// returned future is dropped mid-upload.
    pub async fn store_stream<S>(
        &self,
        key: &str,
        content_type: &str,
        original_name: &str,
        payload: S,
    ) -> StoreResult<StoredObject>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        validate_upload(key, content_type)?;
        self.ensure_storage_dir().await?;

        let mut pending =
            PendingUpload::new(self.base_path.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4())));
        let size_bytes = self.spool(&pending.path, payload).await?;
        let display_name = naming::sanitize_display_name(original_name);

        let lease = KeyLocks::lease(&self.key_locks, key);
        let committed = {
            let _guard = lease.slot.lock().await;
            self.commit(key, &display_name, &mut pending).await
        };
        drop(lease);
        let (stored_name, timestamp) = committed?;
        let display_name = naming::parse(&stored_name)
            .map(|parsed| parsed.display_name.to_string())
            .unwrap_or(display_name);

        info!(
            "stored object {} for key {} ({} bytes)",
            stored_name, key, size_bytes
        );

        Ok(StoredObject {
            key: key.to_string(),
            stored_name,
            display_name,
            uploaded_at: uploaded_at(timestamp),
            size_bytes,
        })
    }

    /// Fetch the current object for `key`.
    ///
    /// Returns `Ok(None)` when the key has no object, when the key could never
    /// have been stored, or when the storage directory does not exist.
    pub async fn fetch(&self, key: &str) -> StoreResult<Option<ObjectContent>> {
        if naming::check_key(key).is_err() {
            return Ok(None);
        }

        // A concurrent replace can remove the resolved file between listing
        // and reading; the second pass sees its successor.
        for _ in 0..2 {
            let listing = self.read_listing().await?;
            let Some(name) = naming::resolve(key, listing.iter().map(String::as_str)) else {
                return Ok(None);
            };

            let data = match fs::read(self.base_path.join(name)).await {
                Ok(data) => data,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!("object {} vanished during fetch, retrying", name);
                    continue;
                }
                Err(err) => return Err(StoreError::Io(err)),
            };

            let Some(object) = describe(name, data.len() as u64) else {
                return Ok(None);
            };
            let etag = format!("{:x}", md5::compute(&data));

            return Ok(Some(ObjectContent {
                content_type: naming::content_type_for(name),
                object,
                etag,
                bytes: Bytes::from(data),
            }));
        }

        Ok(None)
    }

    /// List every object currently on disk, in directory order.
    ///
    /// While a replace is in flight a key may briefly appear twice.
    pub async fn list(&self) -> StoreResult<Vec<StoredObject>> {
        let listing = self.read_listing().await?;
        let mut objects = Vec::with_capacity(listing.len());

        for name in listing {
            if naming::parse(&name).is_none() {
                continue;
            }
            let size_bytes = match fs::metadata(self.base_path.join(&name)).await {
                Ok(meta) => meta.len(),
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(StoreError::Io(err)),
            };
            if let Some(object) = describe(&name, size_bytes) {
                objects.push(object);
            }
        }

        Ok(objects)
    }

    /// Remove every object, returning how many were removed.
    ///
    /// Requires the configured shared secret; a mismatch (or no configured
    /// secret) removes nothing. Uploads still being spooled are left alone.
    pub async fn delete_all(&self, credential: &str) -> StoreResult<usize> {
        if !self.credential_matches(credential) {
            warn!("rejected delete-all request with a bad credential");
            return Err(StoreError::Unauthorized);
        }

        let listing = self.read_listing().await?;
        let mut removed = 0;
        for name in listing.iter().filter(|name| !name.starts_with('.')) {
            match fs::remove_file(self.base_path.join(name)).await {
                Ok(()) => {
                    removed += 1;
                    debug!("deleted object {}", name);
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!("object {} already gone", name);
                }
                Err(err) => return Err(StoreError::Io(err)),
            }
        }

        info!("deleted {} objects", removed);
        Ok(removed)
    }

    /// Startup maintenance: remove temp files left by interrupted uploads and
    /// collapse every key to its newest object.
    ///
    /// Must not run while uploads are in flight, since it treats every temp
    /// file as orphaned.
    pub async fn sweep(&self) -> StoreResult<SweepReport> {
        let listing = self.read_listing().await?;
        let mut report = SweepReport::default();

        for name in listing.iter().filter(|name| name.starts_with(TEMP_PREFIX)) {
            match fs::remove_file(self.base_path.join(name)).await {
                Ok(()) => report.orphaned_temp_files += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!("failed to remove orphaned upload {}: {}", name, err),
            }
        }

        let keys: BTreeSet<&str> = listing
            .iter()
            .filter_map(|name| naming::key_of(name))
            .collect();
        for key in keys {
            report.stale_objects += self.prune(key, &listing).await;
        }

        if report != SweepReport::default() {
            info!(
                "sweep removed {} orphaned uploads and {} stale objects",
                report.orphaned_temp_files, report.stale_objects
            );
        }
        Ok(report)
    }

    /// Copy the payload stream into `path`, enforcing the size cap.
    async fn spool<S>(&self, path: &Path, payload: S) -> StoreResult<u64>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let limit = self.options.max_object_bytes;
        let mut file = File::create(path).await?;
        let mut size_bytes: u64 = 0;

        pin_mut!(payload);
        while let Some(chunk) = payload.next().await {
            let chunk = chunk?;
            size_bytes += chunk.len() as u64;
            if size_bytes > limit {
                debug!("upload exceeded {} bytes, aborting", limit);
                return Err(StoreError::PayloadTooLarge { limit });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok(size_bytes)
    }

    /// Publish a spooled upload as the key's current object. Callers hold
    /// the key's commit lock.
    async fn commit(
        &self,
        key: &str,
        display_name: &str,
        pending: &mut PendingUpload,
    ) -> StoreResult<(String, i64)> {
        let listing = self.read_listing().await?;
        let newest = listing
            .iter()
            .filter_map(|name| naming::parse(name))
            .filter(|parsed| parsed.key == key)
            .map(|parsed| parsed.timestamp)
            .max();

        let timestamp = self.clock.next_after(newest);
        let stored_name = naming::name_for(key, timestamp, display_name);
        fs::rename(&pending.path, self.base_path.join(&stored_name)).await?;
        pending.committed = true;

        self.remove_stale(key).await;
        Ok((stored_name, timestamp))
    }

    /// Remove every object for `key` except the newest. Failures are logged
    /// and skipped.
    async fn remove_stale(&self, key: &str) -> usize {
        match self.read_listing().await {
            Ok(listing) => self.prune(key, &listing).await,
            Err(err) => {
                warn!("could not list {} for cleanup: {}", self.base_path.display(), err);
                0
            }
        }
    }

    async fn prune(&self, key: &str, listing: &[String]) -> usize {
        let Some(current) = naming::resolve(key, listing.iter().map(String::as_str)) else {
            return 0;
        };

        let mut removed = 0;
        for name in listing
            .iter()
            .filter(|name| name.as_str() != current && naming::belongs_to(name, key))
        {
            match fs::remove_file(self.base_path.join(name)).await {
                Ok(()) => {
                    removed += 1;
                    debug!("removed stale object {}", name);
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!("stale object {} already gone", name);
                }
                Err(err) => warn!("failed to remove stale object {}: {}", name, err),
            }
        }
        removed
    }

    /// Names of the regular files in the storage directory. A missing
    /// directory lists as empty.
    async fn read_listing(&self) -> io::Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    fn credential_matches(&self, credential: &str) -> bool {
        match self.options.delete_secret.as_deref() {
            Some(secret) if !secret.is_empty() => {
                secret.len() == credential.len()
                    && secret
                        .bytes()
                        .zip(credential.bytes())
                        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                        == 0
            }
            _ => false,
        }
    }
}

fn validate_upload(key: &str, content_type: &str) -> StoreResult<()> {
    naming::check_key(key).map_err(|reason| StoreError::InvalidKey {
        key: key.to_string(),
        reason,
    })?;
    if !is_image_media_type(content_type) {
        return Err(StoreError::InvalidMediaType(content_type.to_string()));
    }
    Ok(())
}

/// True for `image/<subtype>`, parameters allowed.
fn is_image_media_type(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    match essence.split_once('/') {
        Some((top, sub)) => top.eq_ignore_ascii_case("image") && !sub.trim().is_empty(),
        None => false,
    }
}

fn describe(name: &str, size_bytes: u64) -> Option<StoredObject> {
    let parsed = naming::parse(name)?;
    Some(StoredObject {
        key: parsed.key.to_string(),
        stored_name: name.to_string(),
        display_name: parsed.display_name.to_string(),
        uploaded_at: uploaded_at(parsed.timestamp),
        size_bytes,
    })
}

fn uploaded_at(timestamp: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(timestamp).unwrap_or_default()
}

/// Millisecond clock that never hands out the same value twice.
#[derive(Debug, Default)]
struct MonotonicClock {
    last: AtomicI64,
}

impl MonotonicClock {
    /// Next timestamp, strictly greater than both the previous one and
    /// `floor` when given.
    fn next_after(&self, floor: Option<i64>) -> i64 {
        let now = Utc::now().timestamp_millis();
        let floor = floor.map_or(i64::MIN, |ts| ts.saturating_add(1));
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev.saturating_add(1)).max(floor);
            match self.last.compare_exchange_weak(
                prev,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Per-key async locks serializing commits for the same key.
#[derive(Default)]
struct KeyLocks {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    /// Take a share of the key's lock. The share is returned on drop, so a
    /// cancelled store does not leave its entry behind.
    fn lease(locks: &Arc<Self>, key: &str) -> SlotLease {
        let mut slots = locks.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(key.to_string()).or_default().clone();
        SlotLease {
            locks: Arc::clone(locks),
            key: key.to_string(),
            slot,
        }
    }

    /// Drop the map entry when `slot` is the last outstanding share of it.
    /// Shares are only cloned under the map lock, so the count is stable here.
    fn release(&self, key: &str, slot: &Arc<AsyncMutex<()>>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots
            .get(key)
            .is_some_and(|held| Arc::ptr_eq(held, slot) && Arc::strong_count(held) == 2)
        {
            slots.remove(key);
        }
    }
}

/// One holder's share of a key's commit lock.
struct SlotLease {
    locks: Arc<KeyLocks>,
    key: String,
    slot: Arc<AsyncMutex<()>>,
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.locks.release(&self.key, &self.slot);
    }
}

/// Temp file of an upload that has not been committed yet; removed on drop.
struct PendingUpload {
    path: PathBuf,
    committed: bool,
}

impl PendingUpload {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                warn!(
                    "failed to remove partial upload {}: {}",
                    self.path.display(),
                    err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    const SECRET: &str = "s3cret";

    fn service(dir: &TempDir) -> StorageService {
        StorageService::new(
            dir.path().join("images"),
            StoreOptions {
                max_object_bytes: 1024,
                delete_secret: Some(SECRET.into()),
            },
        )
    }

    /// Every file in the storage directory, hidden ones included.
    fn files_on_disk(service: &StorageService) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&service.base_path) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn replacing_an_image_keeps_only_the_latest() -> Result<()> {
        let dir = TempDir::new()?;
        let store = service(&dir);
        let land1 = Bytes::from_static(b"\x89PNG land one");
        let land2 = Bytes::from_static(b"\x89PNG land two");

        store.store("3", "image/png", "land1.png", land1.clone()).await?;
        let fetched = store.fetch("3").await?.expect("first upload");
        assert_eq!(fetched.bytes, land1);
        assert_eq!(fetched.content_type, "image/png");

        store.store("3", "image/png", "land2.png", land2.clone()).await?;
        let fetched = store.fetch("3").await?.expect("second upload");
        assert_eq!(fetched.bytes, land2);
        assert_eq!(fetched.object.display_name, "land2.png");
        assert_eq!(fetched.etag, format!("{:x}", md5::compute(&land2)));

        let listing = store.list().await?;
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].key, "3");
        assert_eq!(listing[0].size_bytes, land2.len() as u64);

        let files = files_on_disk(&store);
        assert_eq!(files.len(), 1);
        assert_ne!(std::fs::read(store.base_path.join(&files[0]))?, land1.to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn keys_do_not_interfere() -> Result<()> {
        let dir = TempDir::new()?;
        let store = service(&dir);

        store
            .store("1", "image/jpeg", "a.jpg", Bytes::from_static(b"one"))
            .await?;
        store
            .store("12", "image/jpeg", "b.jpg", Bytes::from_static(b"twelve"))
            .await?;
        store
            .store("1", "image/jpeg", "c.jpg", Bytes::from_static(b"uno"))
            .await?;

        let twelve = store.fetch("12").await?.expect("key 12 untouched");
        assert_eq!(twelve.bytes, Bytes::from_static(b"twelve"));
        let one = store.fetch("1").await?.expect("key 1 replaced");
        assert_eq!(one.bytes, Bytes::from_static(b"uno"));
        assert_eq!(store.list().await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn missing_directory_reads_as_empty() -> Result<()> {
        let dir = TempDir::new()?;
        let store = service(&dir);

        assert!(store.fetch("3").await?.is_none());
        assert!(store.list().await?.is_empty());
        assert_eq!(store.sweep().await?, SweepReport::default());
        assert_eq!(store.delete_all(SECRET).await?, 0);
        assert!(!store.base_path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn non_image_uploads_are_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let store = service(&dir);

        let err = store
            .store("3", "text/plain", "notes.txt", Bytes::from_static(b"hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidMediaType(ref t) if t == "text/plain"));
        assert!(store.fetch("3").await?.is_none());
        assert!(files_on_disk(&store).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn oversize_uploads_leave_nothing_behind() -> Result<()> {
        let dir = TempDir::new()?;
        let store = service(&dir);

        let err = store
            .store("3", "image/png", "big.png", Bytes::from(vec![0u8; 1025]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PayloadTooLarge { limit: 1024 }));
        assert!(files_on_disk(&store).is_empty());

        // Rejected mid-stream, after the temp file already holds data.
        let chunks = stream::iter([
            Ok(Bytes::from(vec![1u8; 600])),
            Ok(Bytes::from(vec![2u8; 600])),
        ]);
        let err = store
            .store_stream("3", "image/png", "big.png", chunks)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PayloadTooLarge { .. }));
        assert!(files_on_disk(&store).is_empty());
        assert!(store.fetch("3").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn failed_stream_keeps_previous_object() -> Result<()> {
        let dir = TempDir::new()?;
        let store = service(&dir);
        store
            .store("3", "image/png", "ok.png", Bytes::from_static(b"good"))
            .await?;

        let chunks = stream::iter([
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(ErrorKind::ConnectionReset, "client went away")),
        ]);
        let err = store
            .store_stream("3", "image/png", "broken.png", chunks)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));

        let current = store.fetch("3").await?.expect("previous object survives");
        assert_eq!(current.bytes, Bytes::from_static(b"good"));
        assert_eq!(files_on_disk(&store).len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn dropped_upload_removes_its_temp_file() -> Result<()> {
        let dir = TempDir::new()?;
        let store = service(&dir);

        // The client sends one chunk and then stalls forever.
        let chunks = stream::iter([Ok(Bytes::from_static(b"partial"))]).chain(stream::pending());
        let outcome = timeout(
            Duration::from_millis(50),
            store.store_stream("3", "image/png", "stalled.png", chunks),
        )
        .await;
        assert!(outcome.is_err());

        assert!(store.base_path.is_dir());
        assert!(files_on_disk(&store).is_empty());
        assert!(store.fetch("3").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_commit_releases_its_key_lock() -> Result<()> {
        let dir = TempDir::new()?;
        let store = service(&dir);

        // Hold the key's lock so the store parks waiting for it.
        let held = KeyLocks::lease(&store.key_locks, "3");
        let guard = held.slot.lock().await;
        let outcome = timeout(
            Duration::from_millis(50),
            store.store("3", "image/png", "late.png", Bytes::from_static(b"late")),
        )
        .await;
        assert!(outcome.is_err());
        assert!(files_on_disk(&store).is_empty());

        drop(guard);
        drop(held);
        assert!(store.key_locks.slots.lock().expect("lock").is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn long_key_and_filename_still_store() -> Result<()> {
        let dir = TempDir::new()?;
        let store = service(&dir);
        let key = "k".repeat(128);
        let file_name = format!("{}.png", "n".repeat(200));

        let stored = store
            .store(&key, "image/png", &file_name, Bytes::from_static(b"x"))
            .await?;
        assert!(stored.stored_name.len() <= naming::MAX_PHYSICAL_NAME_LEN);
        assert!(stored.display_name.ends_with(".png"));
        assert!(file_name.starts_with(&stored.display_name[..stored.display_name.len() - 4]));

        let fetched = store.fetch(&key).await?.expect("stored under the long key");
        assert_eq!(fetched.bytes, Bytes::from_static(b"x"));
        assert_eq!(fetched.content_type, "image/png");
        assert_eq!(fetched.object.display_name, stored.display_name);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_keys_are_rejected_and_never_found() -> Result<()> {
        let dir = TempDir::new()?;
        let store = service(&dir);

        let err = store
            .store("a_b", "image/png", "x.png", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey { .. }));
        assert!(store.fetch("a_b").await?.is_none());
        assert!(store.fetch("../etc").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn delete_all_requires_the_secret() -> Result<()> {
        let dir = TempDir::new()?;
        let store = service(&dir);
        for key in ["1", "2", "3"] {
            store
                .store(key, "image/gif", "x.gif", Bytes::from_static(b"GIF89a"))
                .await?;
        }

        let err = store.delete_all("wrong").await.unwrap_err();
        assert!(matches!(err, StoreError::Unauthorized));
        assert_eq!(store.list().await?.len(), 3);

        assert_eq!(store.delete_all(SECRET).await?, 3);
        assert!(store.list().await?.is_empty());
        for key in ["1", "2", "3"] {
            assert!(store.fetch(key).await?.is_none());
        }
        Ok(())
    }

    #[tokio::test]
    async fn delete_all_is_disabled_without_a_secret() -> Result<()> {
        let dir = TempDir::new()?;
        let store = StorageService::new(dir.path(), StoreOptions::default());
        store
            .store("1", "image/png", "a.png", Bytes::from_static(b"a"))
            .await?;

        assert!(matches!(
            store.delete_all("").await,
            Err(StoreError::Unauthorized)
        ));
        assert_eq!(store.list().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn stragglers_are_cleaned_by_the_next_store() -> Result<()> {
        let dir = TempDir::new()?;
        let store = service(&dir);
        store.ensure_storage_dir().await?;
        std::fs::write(store.base_path.join("3_100_old.png"), b"old")?;
        std::fs::write(store.base_path.join("3_200_older-too.png"), b"old")?;
        std::fs::write(store.base_path.join("4_100_other.png"), b"other")?;

        // Two objects for one key: the newest wins.
        let current = store.fetch("3").await?.expect("straggler visible");
        assert_eq!(current.object.stored_name, "3_200_older-too.png");

        let stored = store
            .store("3", "image/png", "new.png", Bytes::from_static(b"new"))
            .await?;
        assert_eq!(
            files_on_disk(&store),
            vec![stored.stored_name.clone(), "4_100_other.png".to_string()]
        );
        assert_eq!(
            store.fetch("3").await?.expect("new object").bytes,
            Bytes::from_static(b"new")
        );
        Ok(())
    }

    #[tokio::test]
    async fn new_object_outranks_stored_future_timestamps() -> Result<()> {
        let dir = TempDir::new()?;
        let store = service(&dir);
        store.ensure_storage_dir().await?;
        // Written by a host whose clock ran ahead.
        let future = Utc::now().timestamp_millis() + 3_600_000;
        std::fs::write(
            store.base_path.join(naming::name_for("3", future, "ahead.png")),
            b"ahead",
        )?;

        let stored = store
            .store("3", "image/png", "now.png", Bytes::from_static(b"now"))
            .await?;
        assert!(naming::parse(&stored.stored_name).expect("valid name").timestamp > future);
        assert_eq!(
            store.fetch("3").await?.expect("current").bytes,
            Bytes::from_static(b"now")
        );
        assert_eq!(files_on_disk(&store).len(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_stores_converge_to_one_object() -> Result<()> {
        let dir = TempDir::new()?;
        let store = service(&dir);

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .store("7", "image/png", &format!("v{i}.png"), Bytes::from(vec![i; 16]))
                    .await
            }));
        }
        let mut stored = Vec::new();
        for handle in handles {
            stored.push(handle.await??);
        }

        let newest = stored
            .iter()
            .max_by_key(|object| {
                naming::parse(&object.stored_name)
                    .map(|parsed| parsed.timestamp)
                    .unwrap_or_default()
            })
            .expect("eight uploads");

        let listing = store.list().await?;
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].stored_name, newest.stored_name);
        assert!(store.key_locks.slots.lock().expect("lock").is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn sweep_removes_orphans_and_duplicates() -> Result<()> {
        let dir = TempDir::new()?;
        let store = service(&dir);
        store.ensure_storage_dir().await?;
        std::fs::write(store.base_path.join(".tmp-abandoned"), b"half")?;
        std::fs::write(store.base_path.join("5_10_a.png"), b"a")?;
        std::fs::write(store.base_path.join("5_20_b.png"), b"b")?;
        std::fs::write(store.base_path.join("6_10_c.png"), b"c")?;

        let report = store.sweep().await?;
        assert_eq!(
            report,
            SweepReport {
                orphaned_temp_files: 1,
                stale_objects: 1,
            }
        );
        assert_eq!(files_on_disk(&store), vec!["5_20_b.png", "6_10_c.png"]);
        Ok(())
    }

    #[test]
    fn media_type_matching() {
        assert!(is_image_media_type("image/png"));
        assert!(is_image_media_type("IMAGE/JPEG"));
        assert!(is_image_media_type("image/svg+xml; charset=utf-8"));
        assert!(!is_image_media_type("image/"));
        assert!(!is_image_media_type("image"));
        assert!(!is_image_media_type("text/plain"));
        assert!(!is_image_media_type("application/octet-stream"));
    }

    #[test]
    fn clock_is_strictly_increasing() {
        let clock = MonotonicClock::default();
        let first = clock.next_after(None);
        let second = clock.next_after(None);
        assert!(second > first);
        assert_eq!(clock.next_after(Some(i64::MAX - 1)), i64::MAX);
    }
}
