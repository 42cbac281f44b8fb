//! Represents one in-progress large-file upload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single upload session, created by "initiate" and removed by
/// "complete" or "cancel".
///
/// The record is persisted as a JSON blob at a reserved key derived from
/// `upload_id`; the blob store itself has no notion of sessions.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    /// Opaque unique identifier, generated at session creation. Immutable.
    pub upload_id: Uuid,

    /// Final storage path for the assembled object. Immutable once assigned.
    pub object_key: String,

    /// Sanitized original file name (only `[A-Za-z0-9._-]` characters).
    pub file_name: String,

    /// Owning course reference. Opaque; not checked against any registry.
    pub course_id: String,

    /// MIME type supplied by the client at initiation. Immutable.
    pub content_type: String,

    /// Timestamp of session creation.
    pub created_at: DateTime<Utc>,

    /// Chunk count most recently declared by the client, recorded so that
    /// cancellation can delete the exact range instead of guessing a bound.
    /// `None` until the first chunk arrives.
    pub total_chunks: Option<u32>,
}

impl UploadSession {
    /// Reserved blob key for this session's metadata record.
    pub fn session_key(upload_id: Uuid) -> String {
        format!("uploads/{}/session.json", upload_id)
    }

    /// Blob key for one chunk of this session.
    pub fn chunk_key(upload_id: Uuid, index: u32) -> String {
        format!("uploads/{}/chunks/{}", upload_id, index)
    }
}
