//! HTTP handlers for the upload lifecycle.
//!
//! Requests are parsed into typed bodies/headers at this boundary and
//! delegated to `UploadService`; every response body is JSON.

use crate::{
    errors::AppError,
    models::session::UploadSession,
    services::{
        blob_store::BlobAttrs,
        upload_service::{NewUpload, UploadService},
    },
};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const UPLOAD_ID_HEADER: &str = "x-upload-id";
const CHUNK_INDEX_HEADER: &str = "x-chunk-index";
const TOTAL_CHUNKS_HEADER: &str = "x-total-chunks";

/// Request body for `POST /upload`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateUploadReq {
    pub file_name: String,
    pub course_id: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateUploadResp {
    pub success: bool,
    pub upload_id: Uuid,
    pub object_key: String,
    pub chunk_size: u64,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResp {
    pub success: bool,
    pub upload_id: Uuid,
    pub next_chunk: u32,
    pub message: String,
}

/// Request body for `POST /complete`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadReq {
    pub upload_id: String,
    pub total_chunks: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadResp {
    pub success: bool,
    pub upload_id: Uuid,
    pub url: String,
    pub object_key: String,
    pub message: String,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelUploadResp {
    pub success: bool,
    pub message: String,
    pub warnings: Vec<String>,
}

/// POST `/upload` — create a new upload session.
pub async fn initiate_upload(
    State(service): State<UploadService>,
    Json(req): Json<InitiateUploadReq>,
) -> Result<impl IntoResponse, AppError> {
    let initiated = service
        .initiate(NewUpload {
            file_name: req.file_name,
            course_id: req.course_id,
            content_type: req.content_type,
        })
        .await?;

    Ok(Json(InitiateUploadResp {
        success: true,
        upload_id: initiated.session.upload_id,
        object_key: initiated.session.object_key,
        chunk_size: initiated.chunk_size,
        message: "Upload session created".into(),
    }))
}

/// PUT `/chunk` — store one raw chunk, addressed by headers.
pub async fn upload_chunk(
    State(service): State<UploadService>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let (upload_id, chunk_index, total_chunks) = parse_chunk_headers(&headers)?;
    let next_chunk = service
        .store_chunk(upload_id, chunk_index, total_chunks, body)
        .await?;

    Ok(Json(ChunkUploadResp {
        success: true,
        upload_id,
        next_chunk,
        message: format!("Chunk {} received", chunk_index),
    }))
}

/// POST `/complete` — assemble all declared chunks into the final object.
pub async fn complete_upload(
    State(service): State<UploadService>,
    Json(req): Json<CompleteUploadReq>,
) -> Result<impl IntoResponse, AppError> {
    let upload_id = parse_upload_id(&req.upload_id)?;
    let completed = service.complete(upload_id, req.total_chunks).await?;

    Ok(Json(CompleteUploadResp {
        success: true,
        upload_id,
        url: completed.url,
        object_key: completed.object_key,
        message: "Upload completed".into(),
        warnings: completed.warnings,
    }))
}

/// GET `/status/{uploadId}` — pure read of the session metadata record.
pub async fn upload_status(
    State(service): State<UploadService>,
    Path(upload_id): Path<String>,
) -> Result<Json<UploadSession>, AppError> {
    let upload_id = parse_upload_id(&upload_id)?;
    Ok(Json(service.status(upload_id).await?))
}

/// DELETE `/cancel/{uploadId}` — best-effort removal of the session and
/// its chunks. Succeeds even when nothing existed to remove.
pub async fn cancel_upload(
    State(service): State<UploadService>,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let upload_id = parse_upload_id(&upload_id)?;
    let outcome = service.cancel(upload_id).await;

    Ok(Json(CancelUploadResp {
        success: true,
        message: "Upload cancelled".into(),
        warnings: outcome.warnings,
    }))
}

/// GET `/files/{*key}` — serve an assembled object.
pub async fn download_object(
    State(service): State<UploadService>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let (attrs, bytes) = service.read_object(&key).await?;

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &attrs);
    Ok(response)
}

/// Fallback for unmatched routes.
pub async fn not_found() -> AppError {
    AppError::not_found("Not found")
}

fn parse_upload_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw.trim())
        .map_err(|e| AppError::bad_request(format!("invalid upload id `{}`: {}", raw, e)))
}

/// Extract `(upload_id, chunk_index, total_chunks)` from the chunk
/// addressing headers, rejecting missing or malformed values.
fn parse_chunk_headers(headers: &HeaderMap) -> Result<(Uuid, u32, u32), AppError> {
    let upload_id = parse_upload_id(required_header(headers, UPLOAD_ID_HEADER)?)?;
    let chunk_index = parse_u32_header(headers, CHUNK_INDEX_HEADER)?;
    let total_chunks = parse_u32_header(headers, TOTAL_CHUNKS_HEADER)?;
    Ok((upload_id, chunk_index, total_chunks))
}

fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::bad_request(format!("missing required header {}", name)))
}

fn parse_u32_header(headers: &HeaderMap, name: &str) -> Result<u32, AppError> {
    required_header(headers, name)?
        .trim()
        .parse::<u32>()
        .map_err(|e| {
            AppError::bad_request(format!(
                "header {} must be a non-negative integer: {}",
                name, e
            ))
        })
}

fn set_object_headers(headers: &mut HeaderMap, attrs: &BlobAttrs) {
    let content_type = attrs
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&attrs.size_bytes.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );

    if let Some(etag) = attrs.etag.as_ref() {
        let quoted = format!("\"{}\"", etag);
        if let Ok(value) = HeaderValue::from_str(&quoted) {
            headers.insert(header::ETAG, value);
        }
    }

    if let Some(modified) = attrs.last_modified.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&modified.to_rfc2822()) {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }
}
