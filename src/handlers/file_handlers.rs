//! HTTP handlers for file operations.
//! Streams upload and download bodies to avoid buffering in memory and
//! delegates storage concerns to `DedupService`.

use crate::{
    errors::AppError,
    models::file_record::FileRecord,
    services::{dedup_service::DedupService, error::StoreError},
};
use axum::{
    Json,
    body::Body,
    extract::{
        FromRequestParts, Multipart, Path, Query, State,
        multipart::MultipartError,
    },
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::io::ReaderStream;

/// Header carrying the authenticated caller's user id.
pub const OWNER_HEADER: &str = "x-owner-id";

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;

/// Authenticated caller, established upstream and passed in `x-owner-id`.
#[derive(Debug, Clone, Copy)]
pub struct Caller(pub i64);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|id| *id > 0)
            .map(Caller)
            .ok_or_else(|| AppError::unauthorized("missing or invalid x-owner-id header"))
    }
}

/// Query params accepted by `GET /files`.
#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    pub limit: Option<i64>,
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    #[serde(flatten)]
    pub file: FileRecord,
    pub deduplicated: bool,
}

#[derive(Debug, Serialize)]
pub struct ListFilesResponse {
    pub files: Vec<FileRecord>,
    pub next_cursor: Option<String>,
}

/// `POST /upload`: multipart form with a single `file` field.
pub async fn upload_file(
    State(service): State<DedupService>,
    Caller(owner_id): Caller,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(multipart_error)?
    {
        if field.name() != Some("file") {
            continue;
        }

        let display_name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| AppError::bad_request("form field 'file' must carry a file name"))?;
        let stream = field.map(|chunk| chunk.map_err(io::Error::other));

        let outcome = service
            .upload(owner_id, &display_name, stream)
            .await
            .map_err(upload_error)?;
        return Ok((
            StatusCode::CREATED,
            Json(UploadResponse {
                file: outcome.record,
                deduplicated: outcome.deduplicated,
            }),
        ));
    }

    Err(AppError::bad_request("file is required (form field 'file')"))
}

/// `GET /files`: the caller's files, newest first.
pub async fn list_files(
    State(service): State<DedupService>,
    Caller(owner_id): Caller,
    Query(q): Query<ListFilesQuery>,
) -> Result<Json<ListFilesResponse>, AppError> {
    let limit = q.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let before_id = q
        .cursor
        .as_deref()
        .map(decode_cursor)
        .transpose()?;

    let files = service.list_records(owner_id, before_id, limit).await?;
    let next_cursor = if files.len() as i64 == limit {
        files.last().map(|f| encode_cursor(f.id))
    } else {
        None
    };

    Ok(Json(ListFilesResponse { files, next_cursor }))
}

/// `GET /files/{id}`: metadata for one file.
pub async fn get_file(
    State(service): State<DedupService>,
    Caller(owner_id): Caller,
    Path(id): Path<i64>,
) -> Result<Json<FileRecord>, AppError> {
    Ok(Json(service.get_record(id, owner_id).await?))
}

/// `GET /files/{id}/download`: stream the file content.
pub async fn download_file(
    State(service): State<DedupService>,
    Caller(owner_id): Caller,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    let download = service.download(id, owner_id).await?;
    let body = Body::from_stream(ReaderStream::new(download.file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_download_headers(response.headers_mut(), &download.record, download.size);
    Ok(response)
}

/// `DELETE /files/{id}`: drop the file; its content goes away with the last reference.
pub async fn delete_file(
    State(service): State<DedupService>,
    Caller(owner_id): Caller,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    service.delete_record(id, owner_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Keep the status axum assigns to multipart failures (413 for an
/// oversized body, 400 for malformed input).
fn multipart_error(err: MultipartError) -> AppError {
    AppError::new(err.status(), err.body_text())
}

/// An upload body cut off by the size limit reports 413; everything else
/// goes through the usual mapping.
fn upload_error(err: StoreError) -> AppError {
    if let StoreError::InputUnavailable(io_err) = &err {
        if let Some(multipart) = io_err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<MultipartError>())
            .filter(|multipart| multipart.status() == StatusCode::PAYLOAD_TOO_LARGE)
        {
            return AppError::new(StatusCode::PAYLOAD_TOO_LARGE, multipart.body_text());
        }
    }
    AppError::from(err)
}

fn set_download_headers(headers: &mut HeaderMap, record: &FileRecord, size: u64) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&record.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&content_disposition(&record.filename))
            .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );
    if let Ok(etag) = HeaderValue::from_str(&format!("\"{}\"", record.hash)) {
        headers.insert(header::ETAG, etag);
    }
}

/// `attachment; filename="..."` with quotes escaped and non-ASCII replaced.
fn content_disposition(filename: &str) -> String {
    let escaped: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();
    format!("attachment; filename=\"{}\"", escaped)
}

fn encode_cursor(last_id: i64) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(last_id.to_string())
}

fn decode_cursor(token: &str) -> Result<i64, AppError> {
    general_purpose::URL_SAFE_NO_PAD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| AppError::bad_request("invalid cursor"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trips_and_rejects_garbage() {
        assert_eq!(decode_cursor(&encode_cursor(42)).unwrap(), 42);
        assert!(decode_cursor("!!not base64!!").is_err());
        assert!(decode_cursor(&general_purpose::URL_SAFE_NO_PAD.encode("abc")).is_err());
    }

    #[test]
    fn disposition_is_header_safe() {
        assert_eq!(
            content_disposition("report \"final\".pdf"),
            "attachment; filename=\"report _final_.pdf\""
        );
        assert_eq!(content_disposition("résumé.txt"), "attachment; filename=\"r_sum_.txt\"");
    }
}
