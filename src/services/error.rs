//! Error kinds surfaced by the deduplicating store.

use crate::models::digest::Digest;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The upload body could not be read to the end.
    #[error("input stream unavailable: {0}")]
    InputUnavailable(#[source] io::Error),
    /// The staged copy could not be written.
    #[error("staging failed: {0}")]
    StagingFailure(#[source] io::Error),
    /// The staged file could not be moved or copied into the object namespace.
    #[error("placing object {digest} failed: {source}")]
    PlacementFailure {
        digest: Digest,
        #[source]
        source: io::Error,
    },
    /// A stored object exists but could not be opened or inspected.
    #[error("reading object {digest} failed: {source}")]
    ObjectUnreadable {
        digest: Digest,
        #[source]
        source: io::Error,
    },
    #[error("metadata catalog unavailable: {0}")]
    CatalogUnavailable(#[from] sqlx::Error),
    #[error("{0} not found")]
    NotFound(String),
    #[error("record {record_id} is not owned by user {requester_id}")]
    PermissionDenied { record_id: i64, requester_id: i64 },
    /// A record points at an object that is missing from disk.
    #[error("record {record_id} references missing object {digest}")]
    Inconsistent { record_id: i64, digest: Digest },
    /// The object namespace could not be enumerated.
    #[error("object namespace unavailable: {0}")]
    NamespaceUnavailable(#[source] io::Error),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub(crate) fn record_not_found(record_id: i64) -> Self {
        Self::NotFound(format!("file {record_id}"))
    }
}
