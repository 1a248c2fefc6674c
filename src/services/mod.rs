//! Deduplicating store core: staging, object placement, catalog and the
//! service that coordinates them.

pub mod catalog;
pub mod dedup_service;
pub mod error;
pub mod object_store;
pub mod sniff;
pub mod staging;

#[cfg(test)]
pub(crate) mod test_support {
    use super::{catalog::Catalog, dedup_service::DedupService, object_store::ObjectStore};
    use bytes::Bytes;
    use futures::{Stream, stream};
    use std::{io, time::Duration};
    use tempfile::TempDir;

    /// File-backed catalog with the schema applied.
    pub async fn test_catalog() -> (TempDir, Catalog) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("catalog.db").display());
        let catalog = Catalog::connect(&url, 5, Duration::from_secs(5))
            .await
            .unwrap();
        catalog.migrate().await.unwrap();
        (dir, catalog)
    }

    /// Service over a fresh catalog and object store in one temp directory.
    pub async fn test_service() -> (TempDir, DedupService) {
        let (dir, catalog) = test_catalog().await;
        let objects = ObjectStore::new(dir.path().join("data"));
        objects.init().await.unwrap();
        (dir, DedupService::new(catalog, objects))
    }

    /// Single-chunk upload body.
    pub fn body(content: &'static [u8]) -> impl Stream<Item = io::Result<Bytes>> {
        stream::iter(vec![Ok(Bytes::from_static(content))])
    }
}
