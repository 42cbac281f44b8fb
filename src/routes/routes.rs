//! Defines routes for the upload coordinator.
//!
//! ## Structure
//! - **Upload lifecycle**
//!   - `POST   /upload`             — initiate an upload session
//!   - `PUT    /chunk`              — store one chunk (addressed by `X-Upload-ID`,
//!     `X-Chunk-Index`, `X-Total-Chunks` headers; body is the raw bytes)
//!   - `POST   /complete`           — assemble all declared chunks into the final object
//!   - `GET    /status/{uploadId}`  — session metadata, 404 when unknown
//!   - `DELETE /cancel/{uploadId}`  — best-effort removal of session and chunks
//!
//! - **Serving & probes**
//!   - `GET /files/{*key}` — download an assembled object
//!   - `GET /healthz`, `GET /readyz`
//!
//! Anything else falls through to a JSON 404.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{
            cancel_upload, complete_upload, download_object, initiate_upload, not_found,
            upload_chunk, upload_status,
        },
    },
    services::upload_service::UploadService,
};
use axum::{
    Router,
    routing::{delete, get, post, put},
};

/// Build and return the router for all coordinator routes.
///
/// The router carries shared state (`UploadService`) to all handlers.
pub fn routes() -> Router<UploadService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // upload lifecycle
        .route("/upload", post(initiate_upload))
        .route("/chunk", put(upload_chunk))
        .route("/complete", post(complete_upload))
        .route("/status/{upload_id}", get(upload_status))
        .route("/cancel/{upload_id}", delete(cancel_upload))
        // assembled objects
        .route("/files/{*key}", get(download_object))
        .fallback(not_found)
}
