//! Hash-while-staging ingest.
//!
//! An upload body is consumed exactly once: every chunk is fed to SHA-256 and
//! appended to a uniquely named file under the staging directory. The first
//! [`SNIFF_LEN`] bytes are retained for content-type detection.

use super::{
    error::{StoreError, StoreResult},
    sniff::SNIFF_LEN,
};
use crate::models::digest::Digest;
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use sha2::{Digest as _, Sha256};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::{fs::OpenOptions, io::AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

/// Suffix of every file written under the staging directory.
pub const STAGED_SUFFIX: &str = ".partial";

/// A file under the staging directory that is deleted when dropped.
///
/// Dropping happens on every exit path (errors, a cancelled request future,
/// or after the object store consumed the file), so an aborted upload never
/// leaves its partial copy behind.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("discarded staged file {}", self.path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(
                "failed to remove staged file {}: {}",
                self.path.display(),
                err
            ),
        }
    }
}

/// Result of staging one upload body.
#[derive(Debug)]
pub struct StagedUpload {
    pub file: StagedFile,
    pub digest: Digest,
    pub size: u64,
    /// Up to [`SNIFF_LEN`] leading bytes of the content.
    pub head: Vec<u8>,
}

/// Staging file name unique per attempt: wall-clock nanos plus a random UUID.
fn staging_file_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("upload-{}-{}{}", nanos, Uuid::new_v4().simple(), STAGED_SUFFIX)
}

/// Stream `stream` into a new file under `staging_dir`, hashing as it goes.
///
/// Read errors from `stream` surface as [`StoreError::InputUnavailable`],
/// write errors as [`StoreError::StagingFailure`]. In both cases the partial
/// file is removed before returning.
pub async fn stage_stream<S>(staging_dir: &Path, stream: S) -> StoreResult<StagedUpload>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let path = staging_dir.join(staging_file_name());
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await
        .map_err(StoreError::StagingFailure)?;
    let staged = StagedFile { path };

    let mut hasher = Sha256::new();
    let mut head = Vec::with_capacity(SNIFF_LEN);
    let mut size: u64 = 0;

    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(StoreError::InputUnavailable)?;
        if head.len() < SNIFF_LEN {
            let take = (SNIFF_LEN - head.len()).min(chunk.len());
            head.extend_from_slice(&chunk[..take]);
        }
        hasher.update(&chunk);
        size += chunk.len() as u64;
        file.write_all(&chunk)
            .await
            .map_err(StoreError::StagingFailure)?;
    }

    file.flush().await.map_err(StoreError::StagingFailure)?;
    file.sync_all().await.map_err(StoreError::StagingFailure)?;
    drop(file);

    let digest = Digest::from_hash(hasher.finalize());
    debug!(
        digest = %digest,
        size,
        "staged upload at {}",
        staged.path.display()
    );

    Ok(StagedUpload {
        file: staged,
        digest,
        size,
        head,
    })
}
