//! Content-addressed object namespace on local disk.
//!
//! Objects live at `root/objects/{aa}/{bb}/{digest}` where `aa`/`bb` are the
//! first two bytes of the digest. Uploads are staged under `root/staging`,
//! which sits on the same volume so placement is a metadata-only operation.
//!
//! Placement and removal for one digest are serialized through
//! [`DigestLocks`]; callers obtain a [`DigestGuard`] from [`ObjectStore::lock`]
//! and pass it to [`ObjectStore::place`] / [`ObjectStore::remove`], which act
//! on the digest the guard was taken for.
//!
//! An object's mtime records when it was last placed. A deduplicated
//! placement refreshes it, so reclaim passes can spare objects that an
//! upload in another process is about to reference.

use super::{
    error::{StoreError, StoreResult},
    staging::{STAGED_SUFFIX, StagedFile},
};
use crate::models::digest::Digest;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::{
    fs::{self, File},
    sync::{Mutex, MutexGuard},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

const OBJECTS_DIR: &str = "objects";
const STAGING_DIR: &str = "staging";
const LOCK_STRIPES: usize = 256;

/// Striped lock table keyed by digest.
///
/// Digests sharing a leading byte share a stripe, which is harmless: the
/// critical sections are short and only need mutual exclusion per digest.
pub struct DigestLocks {
    stripes: Vec<Mutex<()>>,
}

impl DigestLocks {
    pub fn new() -> Self {
        Self {
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    async fn acquire(&self, digest: &Digest) -> MutexGuard<'_, ()> {
        let stripe = usize::from(digest.leading_byte()) % LOCK_STRIPES;
        self.stripes[stripe].lock().await
    }
}

impl Default for DigestLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to one digest in the object namespace.
pub struct DigestGuard<'a> {
    digest: Digest,
    _held: MutexGuard<'a, ()>,
}

impl DigestGuard<'_> {
    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

/// What [`ObjectStore::place`] did with a staged file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// The staged file became the object.
    Placed,
    /// An object already existed; the staged copy was discarded.
    Deduplicated,
}

#[derive(Clone)]
pub struct ObjectStore {
    root: PathBuf,
    locks: Arc<DigestLocks>,
}

impl ObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Arc::new(DigestLocks::new()),
        }
    }

    /// Create the object and staging directories if needed.
    pub async fn init(&self) -> io::Result<()> {
        fs::create_dir_all(self.objects_root()).await?;
        fs::create_dir_all(self.staging_dir()).await
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    fn objects_root(&self) -> PathBuf {
        self.root.join(OBJECTS_DIR)
    }

    /// Canonical location of the object for `digest`.
    pub fn object_path(&self, digest: &Digest) -> PathBuf {
        let (shard_a, shard_b) = digest.shards();
        let mut path = self.objects_root();
        path.push(shard_a);
        path.push(shard_b);
        path.push(digest.as_str());
        path
    }

    /// Take the per-digest lock.
    pub async fn lock(&self, digest: &Digest) -> DigestGuard<'_> {
        DigestGuard {
            digest: digest.clone(),
            _held: self.locks.acquire(digest).await,
        }
    }

    /// Ensure an object exists for the guarded digest, consuming `staged`.
    ///
    /// If the object already exists the staged copy is dropped and only the
    /// existing object's mtime is refreshed. Otherwise the staged file is linked into
    /// place (an atomic no-clobber operation), falling back to a copy through
    /// a temporary sibling when linking is not possible.
    pub async fn place(&self, guard: &DigestGuard<'_>, staged: StagedFile) -> StoreResult<Placement> {
        let digest = guard.digest();
        let target = self.object_path(digest);

        if self.contains(digest).await {
            debug!(digest = %digest, "object already present; discarding staged copy");
            self.touch(&target).await;
            return Ok(Placement::Deduplicated);
        }

        let placement_failure = |source: io::Error| StoreError::PlacementFailure {
            digest: digest.clone(),
            source,
        };

        let parent = target.parent().map(Path::to_path_buf).ok_or_else(|| {
            placement_failure(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await.map_err(placement_failure)?;

        match fs::hard_link(staged.path(), &target).await {
            Ok(()) => Ok(Placement::Placed),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                self.touch(&target).await;
                Ok(Placement::Deduplicated)
            }
            Err(err) => {
                warn!(
                    digest = %digest,
                    "linking staged file failed ({}); falling back to copy",
                    err
                );
                self.copy_into_place(staged.path(), &target)
                    .await
                    .map_err(placement_failure)?;
                Ok(Placement::Placed)
            }
        }
        // `staged` drops here and removes the staging path.
    }

    /// Reset the mtime of an existing object to now. Failures are logged only.
    async fn touch(&self, target: &Path) {
        let path = target.to_path_buf();
        let touched = tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new()
                .write(true)
                .open(&path)?
                .set_modified(SystemTime::now())
        })
        .await;

        match touched {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("failed to refresh mtime of {}: {}", target.display(), err),
            Err(err) => warn!("mtime refresh task for {} failed: {}", target.display(), err),
        }
    }

    /// Time since the object for `digest` was last placed, or `None` if it
    /// is not stored. An mtime in the future counts as zero.
    pub async fn modified_age(&self, digest: &Digest) -> io::Result<Option<Duration>> {
        match fs::metadata(self.object_path(digest)).await {
            Ok(meta) => Ok(Some(meta.modified()?.elapsed().unwrap_or(Duration::ZERO))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Copy `source` next to `target`, then rename it over `target`.
    ///
    /// The temporary sibling is removed on any failure so a truncated file can
    /// never appear under the digest's canonical name.
    async fn copy_into_place(&self, source: &Path, target: &Path) -> io::Result<()> {
        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("object");
        let tmp = target.with_file_name(format!(
            ".{}-{}{}",
            file_name,
            Uuid::new_v4().simple(),
            STAGED_SUFFIX
        ));

        let result = async {
            fs::copy(source, &tmp).await?;
            File::open(&tmp).await?.sync_all().await?;
            fs::rename(&tmp, target).await
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }
        result
    }

    /// Delete the object for the guarded digest.
    ///
    /// Returns `false` if there was nothing to remove. Empty shard
    /// directories are pruned afterwards.
    pub async fn remove(&self, guard: &DigestGuard<'_>) -> io::Result<bool> {
        let target = self.object_path(guard.digest());
        let removed = match fs::remove_file(&target).await {
            Ok(()) => {
                debug!("removed object {}", target.display());
                true
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("object {} already missing", target.display());
                false
            }
            Err(err) => return Err(err),
        };

        if let Some(parent) = target.parent() {
            self.prune_empty_dirs(parent, &self.objects_root()).await;
        }
        Ok(removed)
    }

    /// Open the object for reading, returning the handle and its size.
    pub async fn open(&self, digest: &Digest) -> StoreResult<(File, u64)> {
        let path = self.object_path(digest);
        let not_found = || StoreError::NotFound(format!("object {digest}"));
        let unreadable = |source: io::Error| StoreError::ObjectUnreadable {
            digest: digest.clone(),
            source,
        };

        let file = File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                not_found()
            } else {
                unreadable(err)
            }
        })?;
        let size = file.metadata().await.map_err(unreadable)?.len();
        Ok((file, size))
    }

    /// Whether an object is currently stored for `digest`.
    pub async fn contains(&self, digest: &Digest) -> bool {
        fs::try_exists(self.object_path(digest)).await.unwrap_or(false)
    }

    /// Enumerate every stored object. Entries that are not digests (copy
    /// temporaries, stray files) are skipped.
    pub async fn list_digests(&self) -> io::Result<Vec<Digest>> {
        let mut digests = Vec::new();
        let mut shards = vec![self.objects_root()];
        while let Some(dir) = shards.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    shards.push(entry.path());
                } else if let Some(digest) = entry.file_name().to_str().and_then(Digest::parse) {
                    digests.push(digest);
                }
            }
        }
        digests.sort();
        Ok(digests)
    }

    /// Delete staged files left behind by a previous process.
    ///
    /// Only call this before the server starts accepting uploads.
    pub async fn sweep_staging(&self) -> io::Result<usize> {
        let mut removed = 0;
        let mut entries = match fs::read_dir(self.staging_dir()).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };
        while let Some(entry) = entries.next_entry().await? {
            let is_staged = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.ends_with(STAGED_SUFFIX));
            if is_staged && entry.file_type().await?.is_file() {
                fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("removed {} leftover staged files", removed);
        }
        Ok(removed)
    }

    /// Remove empty directories from `start` upwards, stopping at `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}
