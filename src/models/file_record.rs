//! Represents a logical file owned by a user.

use super::digest::Digest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A user-visible file entry in the `files` table.
///
/// The record stores metadata only. Its bytes live in the object store under
/// `hash`, shared with every other record that uploaded the same content.
/// `size` and `hash` are fixed at upload time and never change afterwards.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct FileRecord {
    /// Catalog-assigned identifier.
    pub id: i64,

    /// User that uploaded the file; the only one allowed to read or delete it.
    pub owner_id: i64,

    /// Original display name supplied with the upload.
    pub filename: String,

    /// Content type sniffed from the leading bytes.
    pub mime_type: String,

    /// Size in bytes of the referenced object.
    pub size: i64,

    /// Content address of the referenced object.
    pub hash: Digest,

    /// When this record was created.
    pub upload_date: DateTime<Utc>,

    /// Number of successful downloads (best-effort counter).
    pub download_count: i64,
}

/// Column values for a record that is about to be inserted.
#[derive(Debug, Clone)]
pub struct NewFileRecord<'a> {
    pub owner_id: i64,
    pub filename: &'a str,
    pub mime_type: &'a str,
    pub size: i64,
    pub hash: &'a Digest,
    pub upload_date: DateTime<Utc>,
}
