//! UploadService — the chunked upload coordinator.
//!
//! Drives one large upload from initiation to a durable final object using
//! only the injected blob store as backing state: no database, no locks,
//! no in-memory session table. Per `upload_id` the lifecycle is
//! initiate → chunk × N (any order, overwrites allowed) → complete, with
//! cancel available at any point.

use crate::{
    models::session::UploadSession,
    services::blob_store::{BlobAttrs, BlobStore, PutOptions, StoreError},
};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::future::join_all;
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default MIME type when the client omits one at initiation.
const DEFAULT_CONTENT_TYPE: &str = "video/mp4";

/// Upper bound for cancellation cleanup when no chunk was ever uploaded,
/// so the declared total is unknown.
const FALLBACK_CLEANUP_SCAN: u32 = 1000;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error(
        "upload {upload_id} is missing {} of {total_chunks} declared chunks (indices {missing:?})",
        .missing.len()
    )]
    Incomplete {
        upload_id: Uuid,
        total_chunks: u32,
        missing: Vec<u32>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type UploadResult<T> = Result<T, UploadError>;

/// Validated input for `initiate`.
#[derive(Clone, Debug)]
pub struct NewUpload {
    pub file_name: String,
    pub course_id: String,
    pub content_type: Option<String>,
}

/// Outcome of `initiate`.
#[derive(Clone, Debug)]
pub struct InitiatedUpload {
    pub session: UploadSession,
    pub chunk_size: u64,
}

/// Outcome of `complete`. `warnings` records best-effort cleanup failures
/// that did not affect the assembled object.
#[derive(Clone, Debug)]
pub struct CompletedUpload {
    pub object_key: String,
    pub url: String,
    pub warnings: Vec<String>,
}

/// Outcome of `cancel`. Cancellation never fails once issued; cleanup
/// problems surface here instead.
#[derive(Clone, Debug, Default)]
pub struct CancelOutcome {
    pub warnings: Vec<String>,
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// The coordinator. Cheap to clone; shared as axum router state.
#[derive(Clone)]
pub struct UploadService {
    store: Arc<dyn BlobStore>,
    public_base_url: String,
    recommended_chunk_size: u64,
}

impl UploadService {
    pub fn new(
        store: Arc<dyn BlobStore>,
        public_base_url: impl Into<String>,
        recommended_chunk_size: u64,
    ) -> Self {
        Self {
            store,
            public_base_url: public_base_url.into(),
            recommended_chunk_size,
        }
    }

    /// Create a new upload session and persist its metadata record.
    ///
    /// The returned chunk size is a recommendation only — the caller, not
    /// the coordinator, decides how many chunks to send and where their
    /// boundaries fall.
    pub async fn initiate(&self, req: NewUpload) -> UploadResult<InitiatedUpload> {
        let file_name = req.file_name.trim();
        if file_name.is_empty() {
            return Err(UploadError::InvalidRequest(
                "fileName must not be empty".into(),
            ));
        }
        let course_id = req.course_id.trim();
        if course_id.is_empty() {
            return Err(UploadError::InvalidRequest(
                "courseId must not be empty".into(),
            ));
        }
        // The course id is embedded in blob keys; keep it a single path
        // segment.
        if course_id.contains(['/', '\\']) || course_id.contains("..") {
            return Err(UploadError::InvalidRequest(
                "courseId must not contain path separators or `..`".into(),
            ));
        }

        let upload_id = Uuid::new_v4();
        let created_at = Utc::now();
        let file_name = sanitize_file_name(file_name);
        let object_key = format!(
            "courses/{}/{}_{}",
            course_id,
            created_at.timestamp_millis(),
            file_name
        );

        let session = UploadSession {
            upload_id,
            object_key,
            file_name,
            course_id: course_id.to_string(),
            content_type: req
                .content_type
                .filter(|ct| !ct.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            created_at,
            total_chunks: None,
        };
        self.save_session(&session).await?;

        info!(
            upload_id = %upload_id,
            object_key = %session.object_key,
            "created upload session"
        );

        Ok(InitiatedUpload {
            session,
            chunk_size: self.recommended_chunk_size,
        })
    }

    /// Store one chunk verbatim, keyed by `(upload_id, chunk_index)`.
    ///
    /// Retransmitting an index replaces the prior bytes, so clients can
    /// retry failed chunks without coordination. The declared total is
    /// recorded on the session so cancellation can delete the exact range.
    /// Returns the next expected index.
    pub async fn store_chunk(
        &self,
        upload_id: Uuid,
        chunk_index: u32,
        total_chunks: u32,
        bytes: Bytes,
    ) -> UploadResult<u32> {
        if total_chunks == 0 {
            return Err(UploadError::InvalidRequest(
                "X-Total-Chunks must be a positive integer".into(),
            ));
        }
        // the next expected index must stay representable
        let next_index = chunk_index.checked_add(1).ok_or_else(|| {
            UploadError::InvalidRequest(format!(
                "X-Chunk-Index {} is too large",
                chunk_index
            ))
        })?;

        let mut session = self.require_session(upload_id).await?;

        let mut tags = BTreeMap::new();
        tags.insert("upload-id".to_string(), upload_id.to_string());
        tags.insert("chunk-index".to_string(), chunk_index.to_string());
        tags.insert("total-chunks".to_string(), total_chunks.to_string());
        self.store
            .put(
                &UploadSession::chunk_key(upload_id, chunk_index),
                bytes,
                PutOptions {
                    content_type: None,
                    custom_tags: tags,
                },
            )
            .await?;

        if session.total_chunks != Some(total_chunks) {
            session.total_chunks = Some(total_chunks);
            self.save_session(&session).await?;
        }

        debug!(upload_id = %upload_id, chunk_index, total_chunks, "stored chunk");
        Ok(next_index)
    }

    /// Assemble the declared chunk range into the final object, then clean
    /// up the session and its chunks best-effort.
    ///
    /// Every declared index must be present: an absent chunk fails the
    /// call with `Incomplete` before anything is written, so a retried
    /// client can upload the gap and call complete again. The final object
    /// is byte-for-byte the in-order concatenation of chunks `0..N-1`.
    pub async fn complete(
        &self,
        upload_id: Uuid,
        total_chunks: u32,
    ) -> UploadResult<CompletedUpload> {
        if total_chunks == 0 {
            return Err(UploadError::InvalidRequest(
                "totalChunks must be a positive integer".into(),
            ));
        }

        let session = self.require_session(upload_id).await?;

        let mut parts = Vec::with_capacity(total_chunks as usize);
        let mut missing = Vec::new();
        for index in 0..total_chunks {
            match self
                .store
                .get(&UploadSession::chunk_key(upload_id, index))
                .await?
            {
                Some(bytes) => parts.push(bytes),
                None => missing.push(index),
            }
        }
        if !missing.is_empty() {
            return Err(UploadError::Incomplete {
                upload_id,
                total_chunks,
                missing,
            });
        }

        let mut assembled = BytesMut::with_capacity(parts.iter().map(Bytes::len).sum());
        for part in &parts {
            assembled.extend_from_slice(part);
        }

        let mut tags = BTreeMap::new();
        tags.insert("course-id".to_string(), session.course_id.clone());
        tags.insert("upload-id".to_string(), upload_id.to_string());
        tags.insert("uploaded-at".to_string(), Utc::now().to_rfc3339());
        let attrs = self
            .store
            .put(
                &session.object_key,
                assembled.freeze(),
                PutOptions {
                    content_type: Some(session.content_type.clone()),
                    custom_tags: tags,
                },
            )
            .await?;

        let mut warnings = self.delete_chunk_range(upload_id, total_chunks).await;
        if let Err(err) = self
            .store
            .delete(&UploadSession::session_key(upload_id))
            .await
        {
            warnings.push(format!("session record: {}", err));
        }
        for warning in &warnings {
            warn!(upload_id = %upload_id, "cleanup after completion: {}", warning);
        }

        info!(
            upload_id = %upload_id,
            object_key = %session.object_key,
            size_bytes = attrs.size_bytes,
            etag = attrs.etag.as_deref().unwrap_or(""),
            "completed upload"
        );

        Ok(CompletedUpload {
            url: format!(
                "{}/{}",
                self.public_base_url.trim_end_matches('/'),
                session.object_key
            ),
            object_key: session.object_key,
            warnings,
        })
    }

    /// Pure read of the session metadata record.
    pub async fn status(&self, upload_id: Uuid) -> UploadResult<UploadSession> {
        self.require_session(upload_id).await
    }

    /// Remove the session record and its chunks. Always succeeds once
    /// issued; individual delete failures are reported as warnings.
    ///
    /// When the session recorded a declared total, exactly that range is
    /// deleted; otherwise a bounded scan covers chunks that may have been
    /// written before the record went missing.
    pub async fn cancel(&self, upload_id: Uuid) -> CancelOutcome {
        let mut warnings = Vec::new();

        let scan = match self.load_session(upload_id).await {
            Ok(Some(session)) => session.total_chunks.unwrap_or(FALLBACK_CLEANUP_SCAN),
            Ok(None) => FALLBACK_CLEANUP_SCAN,
            Err(err) => {
                warnings.push(format!("session record: {}", err));
                FALLBACK_CLEANUP_SCAN
            }
        };

        warnings.extend(self.delete_chunk_range(upload_id, scan).await);
        if let Err(err) = self
            .store
            .delete(&UploadSession::session_key(upload_id))
            .await
        {
            warnings.push(format!("session record: {}", err));
        }
        for warning in &warnings {
            warn!(upload_id = %upload_id, "cleanup after cancellation: {}", warning);
        }

        info!(upload_id = %upload_id, scanned_chunks = scan, "cancelled upload session");
        CancelOutcome { warnings }
    }

    /// Fetch an assembled object for serving. `NotFound` when absent.
    pub async fn read_object(&self, key: &str) -> UploadResult<(BlobAttrs, Bytes)> {
        let bytes = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| UploadError::NotFound(format!("no object at key `{}`", key)))?;
        let attrs = self.store.head(key).await?.unwrap_or_default();
        Ok((attrs, bytes))
    }

    /// Write/read/delete a throwaway probe blob. Used by the readiness
    /// endpoint to verify the backing store end to end.
    pub async fn probe_store(&self) -> Result<(), StoreError> {
        let key = format!("probes/readyz-{}", Uuid::new_v4());
        self.store
            .put(&key, Bytes::from_static(b"readyz"), PutOptions::default())
            .await?;
        let bytes = self.store.get(&key).await?;
        self.store.delete(&key).await?;
        if bytes.as_deref() != Some(&b"readyz"[..]) {
            return Err(StoreError {
                key,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "probe content mismatch",
                ),
            });
        }
        Ok(())
    }

    async fn load_session(&self, upload_id: Uuid) -> UploadResult<Option<UploadSession>> {
        let key = UploadSession::session_key(upload_id);
        match self.store.get(&key).await? {
            Some(bytes) => {
                let session = serde_json::from_slice(&bytes).map_err(|e| {
                    StoreError {
                        key,
                        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
                    }
                })?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    async fn require_session(&self, upload_id: Uuid) -> UploadResult<UploadSession> {
        self.load_session(upload_id).await?.ok_or_else(|| {
            UploadError::NotFound(format!("no upload session found for {}", upload_id))
        })
    }

    async fn save_session(&self, session: &UploadSession) -> UploadResult<()> {
        let key = UploadSession::session_key(session.upload_id);
        let encoded = serde_json::to_vec(session).map_err(|e| StoreError {
            key: key.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;
        self.store
            .put(
                &key,
                Bytes::from(encoded),
                PutOptions {
                    content_type: Some("application/json".to_string()),
                    custom_tags: BTreeMap::new(),
                },
            )
            .await?;
        Ok(())
    }

    /// Best-effort parallel deletion of chunks `0..range`. Missing keys are
    /// no-ops at the store level; real failures come back as warnings.
    async fn delete_chunk_range(&self, upload_id: Uuid, range: u32) -> Vec<String> {
        let deletes = (0..range).map(|index| {
            let store = Arc::clone(&self.store);
            async move {
                store
                    .delete(&UploadSession::chunk_key(upload_id, index))
                    .await
                    .err()
                    .map(|err| format!("chunk {}: {}", index, err))
            }
        });
        join_all(deletes).await.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::blob_store::MemoryBlobStore;

    const CHUNK_SIZE: u64 = 50 * 1024 * 1024;

    fn service() -> (Arc<MemoryBlobStore>, UploadService) {
        let store = Arc::new(MemoryBlobStore::new());
        let svc = UploadService::new(store.clone(), "https://cdn.example.test", CHUNK_SIZE);
        (store, svc)
    }

    fn new_upload(file_name: &str, course_id: &str) -> NewUpload {
        NewUpload {
            file_name: file_name.to_string(),
            course_id: course_id.to_string(),
            content_type: None,
        }
    }

    #[test]
    fn sanitize_replaces_disallowed_characters() {
        assert_eq!(sanitize_file_name("Lesson 1.mp4"), "Lesson_1.mp4");
        assert_eq!(sanitize_file_name("a/b:c*d.mp4"), "a_b_c_d.mp4");
        assert_eq!(sanitize_file_name("vidéo du cours.mp4"), "vid_o_du_cours.mp4");
        assert_eq!(sanitize_file_name("ok-file_v2.mp4"), "ok-file_v2.mp4");
    }

    #[tokio::test]
    async fn initiate_derives_object_key_from_course_and_sanitized_name() {
        let (store, svc) = service();
        let initiated = svc
            .initiate(new_upload("Lesson 1.mp4", "c123"))
            .await
            .unwrap();

        let key = &initiated.session.object_key;
        assert!(key.starts_with("courses/c123/"), "got {key}");
        assert!(key.ends_with("_Lesson_1.mp4"), "got {key}");
        let middle = key
            .strip_prefix("courses/c123/")
            .unwrap()
            .strip_suffix("_Lesson_1.mp4")
            .unwrap();
        assert!(!middle.is_empty() && middle.bytes().all(|b| b.is_ascii_digit()));
        assert!(initiated
            .session
            .file_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')));
        assert_eq!(initiated.chunk_size, CHUNK_SIZE);
        assert!(store.contains(&UploadSession::session_key(initiated.session.upload_id)));
    }

    #[tokio::test]
    async fn initiate_rejects_blank_fields_without_store_writes() {
        let (store, svc) = service();
        for (file_name, course_id) in [("", "c1"), ("  ", "c1"), ("a.mp4", ""), ("a.mp4", " ")] {
            let err = svc
                .initiate(new_upload(file_name, course_id))
                .await
                .unwrap_err();
            assert!(matches!(err, UploadError::InvalidRequest(_)));
        }
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn initiate_rejects_course_ids_that_escape_their_key_segment() {
        let (store, svc) = service();
        for course_id in ["a/b", "..", "a\\b"] {
            let err = svc
                .initiate(new_upload("a.mp4", course_id))
                .await
                .unwrap_err();
            assert!(matches!(err, UploadError::InvalidRequest(_)));
        }
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn initiate_defaults_content_type_to_video() {
        let (_store, svc) = service();
        let initiated = svc.initiate(new_upload("a.mp4", "c1")).await.unwrap();
        assert_eq!(initiated.session.content_type, "video/mp4");

        let initiated = svc
            .initiate(NewUpload {
                content_type: Some("video/webm".into()),
                ..new_upload("a.webm", "c1")
            })
            .await
            .unwrap();
        assert_eq!(initiated.session.content_type, "video/webm");
    }

    #[tokio::test]
    async fn store_chunk_returns_next_index_and_records_declared_total() {
        let (_store, svc) = service();
        let id = svc
            .initiate(new_upload("a.mp4", "c1"))
            .await
            .unwrap()
            .session
            .upload_id;

        let next = svc
            .store_chunk(id, 0, 3, Bytes::from_static(b"aa"))
            .await
            .unwrap();
        assert_eq!(next, 1);
        assert_eq!(svc.status(id).await.unwrap().total_chunks, Some(3));
    }

    #[tokio::test]
    async fn store_chunk_is_idempotent_per_index() {
        let (store, svc) = service();
        let id = svc
            .initiate(new_upload("a.mp4", "c1"))
            .await
            .unwrap()
            .session
            .upload_id;

        svc.store_chunk(id, 0, 1, Bytes::from_static(b"first"))
            .await
            .unwrap();
        svc.store_chunk(id, 0, 1, Bytes::from_static(b"second"))
            .await
            .unwrap();

        let bytes = store
            .get(&UploadSession::chunk_key(id, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&bytes[..], b"second");
    }

    #[tokio::test]
    async fn store_chunk_rejects_index_with_no_representable_successor() {
        let (store, svc) = service();
        let id = svc
            .initiate(new_upload("a.mp4", "c1"))
            .await
            .unwrap()
            .session
            .upload_id;

        let err = svc
            .store_chunk(id, u32::MAX, 1, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidRequest(_)));
        // rejected before anything besides the session record was written
        assert_eq!(store.key_count(), 1);
        assert!(!store.contains(&UploadSession::chunk_key(id, u32::MAX)));
    }

    #[tokio::test]
    async fn store_chunk_requires_an_existing_session() {
        let (_store, svc) = service();
        let err = svc
            .store_chunk(Uuid::new_v4(), 0, 1, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::NotFound(_)));
    }

    #[tokio::test]
    async fn complete_concatenates_chunks_in_index_order() {
        let (store, svc) = service();
        let session = svc.initiate(new_upload("a.mp4", "c1")).await.unwrap().session;
        let id = session.upload_id;

        // uploaded out of order on purpose
        svc.store_chunk(id, 1, 2, Bytes::from_static(b"-tail"))
            .await
            .unwrap();
        svc.store_chunk(id, 0, 2, Bytes::from_static(b"head"))
            .await
            .unwrap();

        let completed = svc.complete(id, 2).await.unwrap();
        assert_eq!(completed.object_key, session.object_key);
        assert_eq!(
            completed.url,
            format!("https://cdn.example.test/{}", session.object_key)
        );
        assert!(completed.warnings.is_empty());

        let bytes = store.get(&session.object_key).await.unwrap().unwrap();
        assert_eq!(&bytes[..], b"head-tail");
        let attrs = store.head(&session.object_key).await.unwrap().unwrap();
        assert_eq!(attrs.content_type.as_deref(), Some("video/mp4"));
        assert_eq!(attrs.custom_tags.get("course-id").unwrap(), "c1");
        assert_eq!(attrs.custom_tags.get("upload-id").unwrap(), &id.to_string());

        // chunks and session record are gone; only the final object remains
        assert_eq!(store.key_count(), 1);
        assert!(matches!(
            svc.status(id).await.unwrap_err(),
            UploadError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn complete_with_missing_chunk_fails_and_writes_nothing() {
        let (store, svc) = service();
        let session = svc.initiate(new_upload("a.mp4", "c1")).await.unwrap().session;
        let id = session.upload_id;

        svc.store_chunk(id, 0, 3, Bytes::from_static(b"a"))
            .await
            .unwrap();
        svc.store_chunk(id, 2, 3, Bytes::from_static(b"c"))
            .await
            .unwrap();

        let err = svc.complete(id, 3).await.unwrap_err();
        match err {
            UploadError::Incomplete {
                total_chunks,
                ref missing,
                ..
            } => {
                assert_eq!(total_chunks, 3);
                assert_eq!(missing, &[1]);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // nothing assembled, session still retryable
        assert!(!store.contains(&session.object_key));
        assert!(svc.status(id).await.is_ok());

        // uploading the gap makes the retry succeed
        svc.store_chunk(id, 1, 3, Bytes::from_static(b"b"))
            .await
            .unwrap();
        svc.complete(id, 3).await.unwrap();
        let bytes = store.get(&session.object_key).await.unwrap().unwrap();
        assert_eq!(&bytes[..], b"abc");
    }

    #[tokio::test]
    async fn complete_requires_session_and_positive_total() {
        let (_store, svc) = service();
        assert!(matches!(
            svc.complete(Uuid::new_v4(), 1).await.unwrap_err(),
            UploadError::NotFound(_)
        ));

        let id = svc
            .initiate(new_upload("a.mp4", "c1"))
            .await
            .unwrap()
            .session
            .upload_id;
        assert!(matches!(
            svc.complete(id, 0).await.unwrap_err(),
            UploadError::InvalidRequest(_)
        ));
    }

    #[tokio::test]
    async fn cancel_unknown_upload_still_reports_success() {
        let (_store, svc) = service();
        let outcome = svc.cancel(Uuid::new_v4()).await;
        assert!(outcome.warnings.is_empty());
    }

    #[tokio::test]
    async fn cancel_removes_session_and_uploaded_chunks() {
        let (store, svc) = service();
        let id = svc
            .initiate(new_upload("a.mp4", "c1"))
            .await
            .unwrap()
            .session
            .upload_id;
        svc.store_chunk(id, 0, 2, Bytes::from_static(b"a"))
            .await
            .unwrap();
        svc.store_chunk(id, 1, 2, Bytes::from_static(b"b"))
            .await
            .unwrap();

        let outcome = svc.cancel(id).await;
        assert!(outcome.warnings.is_empty());
        assert_eq!(store.key_count(), 0);
        assert!(matches!(
            svc.status(id).await.unwrap_err(),
            UploadError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn read_object_serves_assembled_files_and_404s_otherwise() {
        let (_store, svc) = service();
        let session = svc.initiate(new_upload("a.mp4", "c1")).await.unwrap().session;
        let id = session.upload_id;
        svc.store_chunk(id, 0, 1, Bytes::from_static(b"payload"))
            .await
            .unwrap();
        svc.complete(id, 1).await.unwrap();

        let (attrs, bytes) = svc.read_object(&session.object_key).await.unwrap();
        assert_eq!(&bytes[..], b"payload");
        assert_eq!(attrs.content_type.as_deref(), Some("video/mp4"));

        assert!(matches!(
            svc.read_object("courses/c1/missing.mp4").await.unwrap_err(),
            UploadError::NotFound(_)
        ));
    }
}
