//! src/services/dedup_service.rs
//!
//! DedupService ties the staging hasher, the object store and the catalog
//! together. It owns the ordering rules that keep the referential invariant:
//! an object is on disk whenever a record references its digest.
//!
//! Both directions run under the per-digest lock:
//! - upload: stage + hash (unlocked), then lock, place, insert record
//! - delete: lock, delete record, recount references, remove object at zero
//!
//! Holding the lock across the catalog write closes the window between
//! "count reached zero" and "object removed" for every writer in this
//! process. Other processes sharing the data directory are not covered.
//! [`DedupService::reclaim_orphans`] skips objects placed or deduplicated
//! within its grace period, so a standalone reclaim pass cannot take the
//! object of an upload still on its way to the catalog. What remains is a
//! delete in one process racing an upload of the same digest in another.

use super::{
    catalog::Catalog,
    error::{StoreError, StoreResult},
    object_store::{DigestGuard, ObjectStore, Placement},
    sniff::detect_content_type,
    staging::stage_stream,
};
use crate::models::{
    digest::Digest,
    file_record::{FileRecord, NewFileRecord},
};
use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use std::{io, time::Duration};
use tokio::fs::File;
use tracing::{debug, error, info, warn};

const MAX_FILENAME_LEN: usize = 255;

/// Result of a successful upload.
#[derive(Debug)]
pub struct UploadOutcome {
    pub record: FileRecord,
    /// True when the content was already stored and no bytes were written.
    pub deduplicated: bool,
}

/// An object opened for download on behalf of its record.
#[derive(Debug)]
pub struct Download {
    pub record: FileRecord,
    pub file: File,
    pub size: u64,
}

/// Result of deleting a record.
#[derive(Debug)]
pub struct Deletion {
    /// True when this was the last reference and the object was removed.
    pub object_removed: bool,
}

/// Totals from a [`DedupService::reclaim_orphans`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimSummary {
    pub scanned: usize,
    pub removed: usize,
    /// Objects spared because they were placed within the grace period.
    pub recent: usize,
}

#[derive(Clone)]
pub struct DedupService {
    pub catalog: Catalog,
    pub objects: ObjectStore,
}

impl DedupService {
    pub fn new(catalog: Catalog, objects: ObjectStore) -> Self {
        Self { catalog, objects }
    }

    /// Store `stream` for `owner_id` under `display_name`.
    ///
    /// Staging and placement failures leave neither a record nor a staged
    /// file. A catalog failure after placement surfaces as
    /// [`StoreError::CatalogUnavailable`]; the object may then sit
    /// unreferenced until [`DedupService::reclaim_orphans`] runs, and a retry
    /// with the same content takes the dedup path.
    pub async fn upload<S>(
        &self,
        owner_id: i64,
        display_name: &str,
        stream: S,
    ) -> StoreResult<UploadOutcome>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let filename = sanitize_display_name(display_name)?;

        let staged = stage_stream(&self.objects.staging_dir(), stream).await?;
        let mime_type = detect_content_type(&staged.head);
        let size = i64::try_from(staged.size)
            .map_err(|_| StoreError::InvalidInput("upload too large".into()))?;

        let guard = self.objects.lock(&staged.digest).await;
        let placement = self.objects.place(&guard, staged.file).await?;

        let inserted = self
            .catalog
            .insert_record(NewFileRecord {
                owner_id,
                filename: &filename,
                mime_type,
                size,
                hash: &staged.digest,
                upload_date: Utc::now(),
            })
            .await;
        drop(guard);

        let record = match inserted {
            Ok(record) => record,
            Err(err) => {
                warn!(
                    digest = %staged.digest,
                    owner_id,
                    ?placement,
                    "record insert failed after placement; object left for reclaim: {}",
                    err
                );
                return Err(StoreError::CatalogUnavailable(err));
            }
        };

        info!(
            record_id = record.id,
            owner_id,
            digest = %record.hash,
            size = record.size,
            ?placement,
            "stored upload"
        );

        Ok(UploadOutcome {
            record,
            deduplicated: placement == Placement::Deduplicated,
        })
    }

    /// Fetch a record the requester owns.
    pub async fn get_record(&self, record_id: i64, requester_id: i64) -> StoreResult<FileRecord> {
        let record = self
            .catalog
            .find_record(record_id)
            .await?
            .ok_or_else(|| StoreError::record_not_found(record_id))?;

        if record.owner_id != requester_id {
            return Err(StoreError::PermissionDenied {
                record_id,
                requester_id,
            });
        }
        Ok(record)
    }

    /// Page through the requester's records, newest first.
    pub async fn list_records(
        &self,
        owner_id: i64,
        before_id: Option<i64>,
        limit: i64,
    ) -> StoreResult<Vec<FileRecord>> {
        Ok(self
            .catalog
            .list_records(owner_id, before_id, limit)
            .await?)
    }

    /// Open the object behind a record for streaming.
    ///
    /// A record whose object is missing yields [`StoreError::Inconsistent`].
    /// The download counter is bumped best-effort.
    pub async fn download(&self, record_id: i64, requester_id: i64) -> StoreResult<Download> {
        let record = self.get_record(record_id, requester_id).await?;

        let (file, size) = match self.objects.open(&record.hash).await {
            Ok(opened) => opened,
            Err(StoreError::NotFound(_)) => {
                error!(
                    record_id,
                    digest = %record.hash,
                    "record references an object that is missing on disk"
                );
                return Err(StoreError::Inconsistent {
                    record_id,
                    digest: record.hash,
                });
            }
            Err(err) => return Err(err),
        };

        if let Err(err) = self.catalog.increment_download_count(record_id).await {
            warn!(record_id, "failed to bump download counter: {}", err);
        }

        Ok(Download { record, file, size })
    }

    /// Delete a record and reclaim its object if nothing else references it.
    ///
    /// The metadata delete commits before the object is touched, so a crash in
    /// between leaves an orphaned object rather than a dangling record. Once
    /// committed the delete is never undone: a failed recount or removal only
    /// leaves an orphan behind for [`DedupService::reclaim_orphans`].
    pub async fn delete_record(&self, record_id: i64, requester_id: i64) -> StoreResult<Deletion> {
        let record = self.get_record(record_id, requester_id).await?;

        let guard = self.objects.lock(&record.hash).await;
        if !self.catalog.delete_record(record_id, requester_id).await? {
            // Lost a race with another delete of the same record.
            return Err(StoreError::record_not_found(record_id));
        }

        let remaining = match self.remaining_references(&record.hash).await {
            Ok(remaining) => remaining,
            Err(err) => {
                warn!(
                    record_id,
                    digest = %record.hash,
                    "record deleted but reference recount failed; object left for reclaim"
                );
                return Err(err);
            }
        };

        let object_removed = if remaining == 0 {
            self.remove_object(&guard).await
        } else {
            false
        };
        drop(guard);

        info!(
            record_id,
            owner_id = requester_id,
            digest = %record.hash,
            remaining,
            object_removed,
            "deleted record"
        );

        Ok(Deletion { object_removed })
    }

    /// Recount references, retrying once on a transient catalog error.
    async fn remaining_references(&self, digest: &Digest) -> StoreResult<i64> {
        match self.catalog.count_by_digest(digest).await {
            Ok(count) => Ok(count),
            Err(err) => {
                warn!(digest = %digest, "reference recount failed, retrying: {}", err);
                Ok(self.catalog.count_by_digest(digest).await?)
            }
        }
    }

    /// Best-effort removal; failures are logged and leave an orphan.
    async fn remove_object(&self, guard: &DigestGuard<'_>) -> bool {
        match self.objects.remove(guard).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(
                    digest = %guard.digest(),
                    "failed to remove unreferenced object: {}",
                    err
                );
                false
            }
        }
    }

    /// Remove every stored object that no record references.
    ///
    /// Picks up orphans left by failed inserts, failed recounts and crashes
    /// between a delete and its removal. Objects whose mtime is younger than
    /// `grace` are left alone: another process may have placed them and not
    /// yet inserted the record.
    pub async fn reclaim_orphans(&self, grace: Duration) -> StoreResult<ReclaimSummary> {
        let digests = self
            .objects
            .list_digests()
            .await
            .map_err(StoreError::NamespaceUnavailable)?;

        let mut summary = ReclaimSummary::default();
        for digest in digests {
            summary.scanned += 1;
            let guard = self.objects.lock(&digest).await;

            let age = self
                .objects
                .modified_age(&digest)
                .await
                .map_err(StoreError::NamespaceUnavailable)?;
            let Some(age) = age else {
                continue;
            };
            if age < grace {
                debug!(digest = %digest, age_secs = age.as_secs(), "object inside grace period");
                summary.recent += 1;
                continue;
            }

            if self.catalog.count_by_digest(&digest).await? == 0 && self.remove_object(&guard).await
            {
                info!(digest = %digest, "reclaimed orphaned object");
                summary.removed += 1;
            }
        }
        Ok(summary)
    }
}

/// Reduce a client-supplied name to its final path component.
fn sanitize_display_name(raw: &str) -> StoreResult<String> {
    let name = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(raw)
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>();

    if name.is_empty() || name == "." || name == ".." {
        return Err(StoreError::InvalidInput("file name is required".into()));
    }
    if name.len() > MAX_FILENAME_LEN {
        return Err(StoreError::InvalidInput(format!(
            "file name longer than {MAX_FILENAME_LEN} bytes"
        )));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{body, test_service};
    use futures::stream;
    use tokio::io::AsyncReadExt;

    const HELLO_DIGEST: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    async fn read_all(mut file: File) -> Vec<u8> {
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.unwrap();
        buf
    }

    async fn object_count(service: &DedupService) -> usize {
        service.objects.list_digests().await.unwrap().len()
    }

    #[tokio::test]
    async fn hello_world_lifecycle() {
        let (_dir, service) = test_service().await;

        let first = service
            .upload(1, "hello.txt", body(b"hello world"))
            .await
            .unwrap();
        assert_eq!(first.record.hash.as_str(), HELLO_DIGEST);
        assert_eq!(first.record.size, 11);
        assert_eq!(first.record.mime_type, "text/plain; charset=utf-8");
        assert!(!first.deduplicated);
        assert!(service.objects.contains(&first.record.hash).await);

        let deletion = service.delete_record(first.record.id, 1).await.unwrap();
        assert!(deletion.object_removed);
        assert!(!service.objects.contains(&first.record.hash).await);
        assert!(matches!(
            service.download(first.record.id, 1).await,
            Err(StoreError::NotFound(_))
        ));

        let again = service
            .upload(1, "hello.txt", body(b"hello world"))
            .await
            .unwrap();
        assert_ne!(again.record.id, first.record.id);
        assert!(!again.deduplicated);
        assert!(service.objects.contains(&again.record.hash).await);
    }

    #[tokio::test]
    async fn download_returns_uploaded_bytes_and_counts() {
        let (_dir, service) = test_service().await;
        let content: &'static [u8] = b"\x89PNG\r\n\x1a\n binary-ish payload \x00\x01\x02";
        let uploaded = service.upload(3, "pic.png", body(content)).await.unwrap();

        let download = service.download(uploaded.record.id, 3).await.unwrap();
        assert_eq!(download.size, content.len() as u64);
        assert_eq!(download.record.mime_type, "image/png");
        assert_eq!(read_all(download.file).await, content.to_vec());

        let record = service.get_record(uploaded.record.id, 3).await.unwrap();
        assert_eq!(record.download_count, 1);
    }

    #[tokio::test]
    async fn same_content_twice_shares_one_object() {
        let (_dir, service) = test_service().await;
        let a = service.upload(1, "a.txt", body(b"dup")).await.unwrap();
        let b = service.upload(1, "b.txt", body(b"dup")).await.unwrap();
        let c = service.upload(1, "c.txt", body(b"dupe")).await.unwrap();

        assert_ne!(a.record.id, b.record.id);
        assert_eq!(a.record.hash, b.record.hash);
        assert_ne!(a.record.hash, c.record.hash);
        assert!(b.deduplicated);
        assert_eq!(object_count(&service).await, 2);
    }

    #[tokio::test]
    async fn shared_object_survives_until_last_owner_deletes() {
        let (_dir, service) = test_service().await;
        let alice = service.upload(1, "report.pdf", body(b"shared")).await.unwrap();
        let bob = service.upload(2, "copy.pdf", body(b"shared")).await.unwrap();
        let digest = alice.record.hash.clone();

        let first = service.delete_record(alice.record.id, 1).await.unwrap();
        assert!(!first.object_removed);
        assert!(service.objects.contains(&digest).await);

        let download = service.download(bob.record.id, 2).await.unwrap();
        assert_eq!(read_all(download.file).await, b"shared".to_vec());

        let last = service.delete_record(bob.record.id, 2).await.unwrap();
        assert!(last.object_removed);
        assert!(!service.objects.contains(&digest).await);
    }

    #[tokio::test]
    async fn non_owner_gets_permission_denied() {
        let (_dir, service) = test_service().await;
        let record = service
            .upload(1, "private.txt", body(b"secret"))
            .await
            .unwrap()
            .record;

        assert!(matches!(
            service.download(record.id, 2).await,
            Err(StoreError::PermissionDenied { .. })
        ));
        assert!(matches!(
            service.delete_record(record.id, 2).await,
            Err(StoreError::PermissionDenied { .. })
        ));
        assert!(service.get_record(record.id, 1).await.is_ok());
        assert!(service.objects.contains(&record.hash).await);
    }

    #[tokio::test]
    async fn unknown_record_is_not_found() {
        let (_dir, service) = test_service().await;

        assert!(matches!(
            service.download(404, 1).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            service.delete_record(404, 1).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn missing_object_is_reported_as_inconsistent() {
        let (_dir, service) = test_service().await;
        let record = service
            .upload(1, "vanishing.bin", body(b"gone soon"))
            .await
            .unwrap()
            .record;
        std::fs::remove_file(service.objects.object_path(&record.hash)).unwrap();

        assert!(matches!(
            service.download(record.id, 1).await,
            Err(StoreError::Inconsistent { .. })
        ));
        let record = service.get_record(record.id, 1).await.unwrap();
        assert_eq!(record.download_count, 0);
    }

    #[tokio::test]
    async fn failed_read_creates_nothing() {
        let (_dir, service) = test_service().await;
        let broken = stream::iter(vec![
            Ok(Bytes::from_static(b"half")),
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "disconnect")),
        ]);

        let err = service.upload(1, "broken.bin", broken).await.unwrap_err();
        assert!(matches!(err, StoreError::InputUnavailable(_)));
        assert_eq!(object_count(&service).await, 0);
        assert!(service.list_records(1, None, 10).await.unwrap().is_empty());
        assert!(
            std::fs::read_dir(service.objects.staging_dir())
                .unwrap()
                .next()
                .is_none()
        );
    }

    #[tokio::test]
    async fn catalog_outage_surfaces_and_orphan_is_reclaimed() {
        let (_dir, service) = test_service().await;
        service.catalog.db.close().await;

        let err = service
            .upload(1, "orphan.txt", body(b"orphan"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CatalogUnavailable(_)));
        assert_eq!(object_count(&service).await, 1);

        let (_dir2, fresh) = test_service().await;
        let recovered = DedupService::new(fresh.catalog.clone(), service.objects.clone());
        let summary = recovered.reclaim_orphans(Duration::ZERO).await.unwrap();
        assert_eq!(
            summary,
            ReclaimSummary {
                scanned: 1,
                removed: 1,
                recent: 0
            }
        );
        assert_eq!(object_count(&service).await, 0);
    }

    #[tokio::test]
    async fn reclaim_keeps_referenced_objects() {
        let (_dir, service) = test_service().await;
        service.upload(1, "kept.txt", body(b"kept")).await.unwrap();

        let summary = service.reclaim_orphans(Duration::ZERO).await.unwrap();
        assert_eq!(
            summary,
            ReclaimSummary {
                scanned: 1,
                removed: 0,
                recent: 0
            }
        );
        assert_eq!(object_count(&service).await, 1);
    }

    #[tokio::test]
    async fn reclaim_spares_object_placed_by_another_process() {
        let (_dir, server) = test_service().await;
        // A second store over the same directory has its own lock table,
        // like a separate reclaim process.
        let reclaimer = DedupService::new(
            server.catalog.clone(),
            ObjectStore::new(server.objects.staging_dir().parent().unwrap()),
        );

        let staged = stage_stream(&server.objects.staging_dir(), body(b"in flight"))
            .await
            .unwrap();
        let guard = server.objects.lock(&staged.digest).await;
        server.objects.place(&guard, staged.file).await.unwrap();

        let summary = reclaimer
            .reclaim_orphans(Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(
            summary,
            ReclaimSummary {
                scanned: 1,
                removed: 0,
                recent: 1
            }
        );

        let record = server
            .catalog
            .insert_record(NewFileRecord {
                owner_id: 1,
                filename: "late.txt",
                mime_type: "text/plain; charset=utf-8",
                size: staged.size as i64,
                hash: &staged.digest,
                upload_date: Utc::now(),
            })
            .await
            .unwrap();
        drop(guard);

        let download = server.download(record.id, 1).await.unwrap();
        assert_eq!(read_all(download.file).await, b"in flight".to_vec());
    }

    #[tokio::test]
    async fn recount_is_retried_once_after_a_catalog_error() {
        let (_dir, service) = test_service().await;
        let record = service
            .upload(1, "retry.txt", body(b"retry"))
            .await
            .unwrap()
            .record;

        service.catalog.fail_next_counts(1);
        let deletion = service.delete_record(record.id, 1).await.unwrap();

        assert_eq!(service.catalog.pending_count_faults(), 0);
        assert!(deletion.object_removed);
        assert!(!service.objects.contains(&record.hash).await);
    }

    #[tokio::test]
    async fn failed_recount_keeps_delete_and_leaves_object_for_reclaim() {
        let (_dir, service) = test_service().await;
        let record = service
            .upload(1, "stuck.txt", body(b"stuck"))
            .await
            .unwrap()
            .record;

        service.catalog.fail_next_counts(2);
        let err = service.delete_record(record.id, 1).await.unwrap_err();

        assert!(matches!(err, StoreError::CatalogUnavailable(_)));
        assert_eq!(service.catalog.pending_count_faults(), 0);
        assert!(service.catalog.find_record(record.id).await.unwrap().is_none());
        assert!(service.objects.contains(&record.hash).await);

        let summary = service.reclaim_orphans(Duration::ZERO).await.unwrap();
        assert_eq!(summary.removed, 1);
        assert!(!service.objects.contains(&record.hash).await);
    }

    #[tokio::test]
    async fn rejects_empty_names() {
        let (_dir, service) = test_service().await;
        let err = service.upload(1, "  ", body(b"x")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)));
    }

    #[test]
    fn display_names_keep_only_the_last_component() {
        assert_eq!(sanitize_display_name("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_display_name("C:\\docs\\a.txt").unwrap(), "a.txt");
        assert_eq!(sanitize_display_name(" report.pdf ").unwrap(), "report.pdf");
        assert!(sanitize_display_name("dir/").is_err());
        assert!(sanitize_display_name(&"x".repeat(MAX_FILENAME_LEN + 1)).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_identical_uploads_share_one_object() {
        let (_dir, service) = test_service().await;
        let mut tasks = Vec::new();
        for owner in 0..8 {
            let service = service.clone();
            tasks.push(tokio::spawn(async move {
                service
                    .upload(owner % 3, "same.bin", body(b"identical content"))
                    .await
            }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap().record.id);
        }
        ids.sort();
        ids.dedup();

        assert_eq!(ids.len(), 8);
        assert_eq!(object_count(&service).await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deletes_remove_object_exactly_when_unreferenced() {
        let (_dir, service) = test_service().await;
        let mut records = Vec::new();
        for owner in 1..=4 {
            records.push(service.upload(owner, "x", body(b"refcounted")).await.unwrap().record);
        }
        let digest = records[0].hash.clone();
        let survivor = records.pop().unwrap();

        let mut tasks = Vec::new();
        for record in records {
            let service = service.clone();
            tasks.push(tokio::spawn(async move {
                service.delete_record(record.id, record.owner_id).await
            }));
        }
        for task in tasks {
            assert!(!task.await.unwrap().unwrap().object_removed);
        }
        assert!(service.objects.contains(&digest).await);

        let last = service
            .delete_record(survivor.id, survivor.owner_id)
            .await
            .unwrap();
        assert!(last.object_removed);
        assert!(!service.objects.contains(&digest).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_upload_and_delete_never_strand_a_record() {
        let (_dir, service) = test_service().await;
        let existing = service.upload(1, "a", body(b"raced")).await.unwrap().record;

        let deleter = {
            let service = service.clone();
            tokio::spawn(async move { service.delete_record(existing.id, 1).await })
        };
        let uploader = {
            let service = service.clone();
            tokio::spawn(async move { service.upload(2, "b", body(b"raced")).await })
        };
        deleter.await.unwrap().unwrap();
        let uploaded = uploader.await.unwrap().unwrap().record;

        let download = service.download(uploaded.id, 2).await.unwrap();
        assert_eq!(read_all(download.file).await, b"raced".to_vec());
    }
}
