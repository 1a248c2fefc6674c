use crate::services::error::StoreError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::error;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for 401 Unauthorized
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::InputUnavailable(_) | StoreError::InvalidInput(_) => {
                AppError::bad_request(err.to_string())
            }
            StoreError::NotFound(_) => AppError::new(StatusCode::NOT_FOUND, err.to_string()),
            StoreError::PermissionDenied { .. } => {
                AppError::new(StatusCode::FORBIDDEN, "only the owner can access this file")
            }
            StoreError::Inconsistent { record_id, .. } => AppError::new(
                StatusCode::NOT_FOUND,
                format!("content for file {record_id} is missing on the server"),
            ),
            StoreError::CatalogUnavailable(_) => {
                error!("catalog error: {}", err);
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "metadata catalog unavailable")
            }
            StoreError::StagingFailure(_)
            | StoreError::PlacementFailure { .. }
            | StoreError::ObjectUnreadable { .. }
            | StoreError::NamespaceUnavailable(_) => {
                error!("storage error: {}", err);
                AppError::internal("storage failure")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::digest::Digest;
    use std::io;

    #[test]
    fn maps_store_errors_to_statuses() {
        let cases = [
            (
                StoreError::InputUnavailable(io::Error::other("reset")),
                StatusCode::BAD_REQUEST,
            ),
            (StoreError::NotFound("file 1".into()), StatusCode::NOT_FOUND),
            (
                StoreError::PermissionDenied {
                    record_id: 1,
                    requester_id: 2,
                },
                StatusCode::FORBIDDEN,
            ),
            (
                StoreError::Inconsistent {
                    record_id: 1,
                    digest: Digest::parse(&"a".repeat(64)).unwrap(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                StoreError::CatalogUnavailable(sqlx::Error::PoolTimedOut),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                StoreError::StagingFailure(io::Error::other("disk full")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                StoreError::ObjectUnreadable {
                    digest: Digest::parse(&"b".repeat(64)).unwrap(),
                    source: io::Error::from(io::ErrorKind::PermissionDenied),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn permission_denied_does_not_leak_owner() {
        let err = AppError::from(StoreError::PermissionDenied {
            record_id: 5,
            requester_id: 9,
        });
        assert!(!err.message.contains('9'));
    }
}
