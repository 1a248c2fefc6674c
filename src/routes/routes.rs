//! Defines routes for the file API.
//!
//! ## Structure
//! - `POST   /upload`: multipart upload (field `file`)
//! - `GET    /files`: list the caller's files (`limit`, `cursor`)
//! - `GET    /files/{id}`: file metadata
//! - `GET    /files/{id}/download`: stream file content
//! - `DELETE /files/{id}`: delete a file
//! - `GET    /healthz`, `GET /readyz`
//!
//! Every `/upload` and `/files` route requires the `x-owner-id` header.

use crate::{
    handlers::{
        file_handlers::{delete_file, download_file, get_file, list_files, upload_file},
        health_handlers::{healthz, readyz},
    },
    services::dedup_service::DedupService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router. The router carries `DedupService` as shared state.
///
/// `max_upload_bytes` caps the request body of `/upload` only.
pub fn routes(max_upload_bytes: usize) -> Router<DedupService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/upload",
            post(upload_file).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/files", get(list_files))
        .route("/files/{id}", get(get_file).delete(delete_file))
        .route("/files/{id}/download", get(download_file))
}
