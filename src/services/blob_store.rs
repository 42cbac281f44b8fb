//! Blob store abstraction backing the upload coordinator.
//!
//! The coordinator persists everything — session records, chunk payloads,
//! and final assembled objects — through this one key/value interface, so
//! it stays stateless and horizontally replicable. `FsBlobStore` is the
//! production implementation on local disk; tests use the in-memory double
//! at the bottom of this file.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MAX_KEY_LEN: usize = 1024;

/// Failure talking to the backing store, tagged with the key involved.
#[derive(Debug, Error)]
#[error("blob store failure on key `{key}`: {source}")]
pub struct StoreError {
    pub key: String,
    #[source]
    pub source: io::Error,
}

impl StoreError {
    fn new(key: &str, source: io::Error) -> Self {
        Self {
            key: key.to_string(),
            source,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Attributes attached to a stored blob.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct BlobAttrs {
    pub content_type: Option<String>,
    pub size_bytes: u64,
    pub etag: Option<String>,
    pub custom_tags: BTreeMap<String, String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Options accepted by `put`.
#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub custom_tags: BTreeMap<String, String>,
}

/// Minimal key/value blob interface: the only persistence the coordinator
/// depends on. `delete` is idempotent — removing an absent key is a no-op.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Bytes, opts: PutOptions) -> StoreResult<BlobAttrs>;
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>>;
    async fn head(&self, key: &str) -> StoreResult<Option<BlobAttrs>>;
    async fn delete(&self, key: &str) -> StoreResult<()>;
}

/// Filesystem-backed blob store rooted at `base_path`.
///
/// Keys map directly to relative paths beneath the root. Attributes are
/// kept in a `{key}.attrs` JSON sidecar next to each payload.
#[derive(Clone, Debug)]
pub struct FsBlobStore {
    base_path: PathBuf,
}

impl FsBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    ///
    /// Rejects keys that are empty, overlong, begin with `/`, or contain
    /// `..`, control bytes, or backslashes.
    fn ensure_key_safe(key: &str) -> StoreResult<()> {
        let bad = |reason: &str| {
            Err(StoreError::new(
                key,
                io::Error::new(ErrorKind::InvalidInput, reason.to_string()),
            ))
        };
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return bad("key must be 1..=1024 bytes");
        }
        if key.starts_with('/') || key.contains("..") {
            return bad("key must be a relative path without `..`");
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return bad("key contains control bytes");
        }
        Ok(())
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    fn attrs_path(&self, key: &str) -> PathBuf {
        self.base_path.join(format!("{}.attrs", key))
    }

    /// Recursively remove empty directories from `start` up to the store
    /// root. Stops at the first non-empty or missing directory.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    /// Write bytes durably: temp file, flush, fsync, rename into place.
    /// Overwrites are allowed (last write wins).
    async fn put(&self, key: &str, bytes: Bytes, opts: PutOptions) -> StoreResult<BlobAttrs> {
        Self::ensure_key_safe(key)?;
        let file_path = self.blob_path(key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::new(key, io::Error::other("blob path missing parent directory"))
        })?;
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| StoreError::new(key, e))?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let write = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<_, io::Error>(())
        };
        if let Err(err) = write.await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::new(key, err));
        }
        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::new(key, err));
        }

        let attrs = BlobAttrs {
            content_type: opts.content_type,
            size_bytes: bytes.len() as u64,
            etag: Some(format!("{:x}", md5::compute(&bytes))),
            custom_tags: opts.custom_tags,
            last_modified: Some(Utc::now()),
        };
        let encoded = serde_json::to_vec(&attrs)
            .map_err(|e| StoreError::new(key, io::Error::new(ErrorKind::InvalidData, e)))?;
        fs::write(self.attrs_path(key), encoded)
            .await
            .map_err(|e| StoreError::new(key, e))?;

        Ok(attrs)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        Self::ensure_key_safe(key)?;
        match fs::read(self.blob_path(key)).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::new(key, err)),
        }
    }

    async fn head(&self, key: &str) -> StoreResult<Option<BlobAttrs>> {
        Self::ensure_key_safe(key)?;
        match fs::read(self.attrs_path(key)).await {
            Ok(bytes) => {
                let attrs = serde_json::from_slice(&bytes).map_err(|e| {
                    StoreError::new(key, io::Error::new(ErrorKind::InvalidData, e))
                })?;
                Ok(Some(attrs))
            }
            // Sidecar missing: fall back to the payload itself so blobs
            // written out of band still answer HEAD.
            Err(err) if err.kind() == ErrorKind::NotFound => {
                match fs::metadata(self.blob_path(key)).await {
                    Ok(meta) => Ok(Some(BlobAttrs {
                        size_bytes: meta.len(),
                        ..BlobAttrs::default()
                    })),
                    Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
                    Err(err) => Err(StoreError::new(key, err)),
                }
            }
            Err(err) => Err(StoreError::new(key, err)),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        Self::ensure_key_safe(key)?;
        let file_path = self.blob_path(key);
        for path in [&file_path, &self.attrs_path(key)] {
            match fs::remove_file(path).await {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!("blob {} already missing", path.display());
                }
                Err(err) => return Err(StoreError::new(key, err)),
            }
        }
        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }
}

/// In-memory store double used by coordinator unit tests.
#[cfg(test)]
pub struct MemoryBlobStore {
    blobs: std::sync::Mutex<BTreeMap<String, (BlobAttrs, Bytes)>>,
}

#[cfg(test)]
impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: std::sync::Mutex::new(BTreeMap::new()),
        }
    }

    pub fn key_count(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.blobs.lock().unwrap().contains_key(key)
    }
}

#[cfg(test)]
#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Bytes, opts: PutOptions) -> StoreResult<BlobAttrs> {
        let attrs = BlobAttrs {
            content_type: opts.content_type,
            size_bytes: bytes.len() as u64,
            etag: Some(format!("{:x}", md5::compute(&bytes))),
            custom_tags: opts.custom_tags,
            last_modified: Some(Utc::now()),
        };
        self.blobs
            .lock()
            .unwrap()
            .insert(key.to_string(), (attrs.clone(), bytes));
        Ok(attrs)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        Ok(self
            .blobs
            .lock()
            .unwrap()
            .get(key)
            .map(|(_, bytes)| bytes.clone()))
    }

    async fn head(&self, key: &str) -> StoreResult<Option<BlobAttrs>> {
        Ok(self
            .blobs
            .lock()
            .unwrap()
            .get(key)
            .map(|(attrs, _)| attrs.clone()))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.blobs.lock().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_store() -> (tempfile::TempDir, FsBlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn put_then_get_roundtrips_bytes_and_attrs() {
        let (_dir, store) = fs_store();
        let mut tags = BTreeMap::new();
        tags.insert("course-id".to_string(), "c1".to_string());

        let attrs = store
            .put(
                "courses/c1/video.mp4",
                Bytes::from_static(b"abc"),
                PutOptions {
                    content_type: Some("video/mp4".into()),
                    custom_tags: tags,
                },
            )
            .await
            .unwrap();
        assert_eq!(attrs.size_bytes, 3);
        assert_eq!(attrs.etag.as_deref(), Some("900150983cd24fb0d6963f7d28e17f72"));

        let bytes = store.get("courses/c1/video.mp4").await.unwrap().unwrap();
        assert_eq!(&bytes[..], b"abc");

        let head = store.head("courses/c1/video.mp4").await.unwrap().unwrap();
        assert_eq!(head.content_type.as_deref(), Some("video/mp4"));
        assert_eq!(head.custom_tags.get("course-id").unwrap(), "c1");
    }

    #[tokio::test]
    async fn put_overwrites_existing_key() {
        let (_dir, store) = fs_store();
        store
            .put("k", Bytes::from_static(b"old"), PutOptions::default())
            .await
            .unwrap();
        store
            .put("k", Bytes::from_static(b"new"), PutOptions::default())
            .await
            .unwrap();
        let bytes = store.get("k").await.unwrap().unwrap();
        assert_eq!(&bytes[..], b"new");
    }

    #[tokio::test]
    async fn get_missing_key_returns_none() {
        let (_dir, store) = fs_store();
        assert!(store.get("nope").await.unwrap().is_none());
        assert!(store.head("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_prunes_empty_dirs() {
        let (dir, store) = fs_store();
        store
            .put("uploads/u1/chunks/0", Bytes::from_static(b"x"), PutOptions::default())
            .await
            .unwrap();
        store.delete("uploads/u1/chunks/0").await.unwrap();
        // second delete of the same key is a no-op
        store.delete("uploads/u1/chunks/0").await.unwrap();
        assert!(store.get("uploads/u1/chunks/0").await.unwrap().is_none());
        assert!(!dir.path().join("uploads").exists());
    }

    #[tokio::test]
    async fn rejects_unsafe_keys() {
        let (_dir, store) = fs_store();
        for key in ["", "/abs/path", "a/../b", "a\\b"] {
            assert!(store.get(key).await.is_err(), "key {:?} should be rejected", key);
        }
    }
}
