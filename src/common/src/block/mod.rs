//! Block model for the tessera object store layout.
//!
//! Every tenant owns a flat namespace of immutable blocks:
//!
//! ```text
//! <tenant>/<block-ulid>/meta.json
//! <tenant>/<block-ulid>/index
//! <tenant>/<block-ulid>/chunks/000001
//! <tenant>/<block-ulid>/deletion-mark.json
//! <tenant>/markers/tenant-deletion-mark.json
//! ```
//!
//! A block is *complete* when its `meta.json` is present and parseable, and
//! *partial* otherwise. Partiality is recomputed on every scan.

pub mod fetcher;
pub mod filter;
pub mod marker;

pub use fetcher::{FetchError, FetchResult, MetaFetcher, MetaSyncError, MetadataFilter};
pub use filter::DeletionMarkFilter;
pub use marker::{DeletionMark, MarkerError, TenantDeletionMark};

use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use serde::{Deserialize, Serialize};
use tracing::warn;
use ulid::Ulid;

/// Name of the block metadata object.
pub const META_FILENAME: &str = "meta.json";

/// Name of the per-block deletion marker object.
pub const DELETION_MARK_FILENAME: &str = "deletion-mark.json";

/// Current version of the `meta.json` format.
pub const META_VERSION: u32 = 1;

/// Metadata of one complete block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Block identifier. ULIDs are time-sortable, so the store lists blocks
    /// roughly in creation order.
    pub id: Ulid,
    /// Minimum sample timestamp covered by the block, unix milliseconds.
    pub min_time: i64,
    /// Maximum sample timestamp covered by the block, unix milliseconds.
    pub max_time: i64,
    /// Metadata format version.
    pub version: u32,
}

/// Storage prefix of one block's objects.
pub fn block_prefix(tenant_id: &str, block_id: Ulid) -> ObjectPath {
    ObjectPath::from(format!("{tenant_id}/{block_id}"))
}

/// Path of a block's metadata object.
pub fn meta_path(tenant_id: &str, block_id: Ulid) -> ObjectPath {
    ObjectPath::from(format!("{tenant_id}/{block_id}/{META_FILENAME}"))
}

/// Path of a block's deletion marker object.
pub fn deletion_mark_path(tenant_id: &str, block_id: Ulid) -> ObjectPath {
    ObjectPath::from(format!("{tenant_id}/{block_id}/{DELETION_MARK_FILENAME}"))
}

/// Returns the block ID if `name` looks like a block directory name.
///
/// Non-block entries under a tenant (such as the `markers/` directory) do not
/// parse as ULIDs and are skipped by every scan.
pub fn parse_block_dir(name: &str) -> Option<Ulid> {
    Ulid::from_string(name).ok()
}

/// Hard-delete all objects composing one block.
///
/// Deletion is best-effort per object: every object is attempted, an already
/// missing object counts as deleted, and the deletion marker is removed last
/// so that an interrupted delete still leaves the block marked and resumable
/// by the next run. Returns an error if at least one object could not be
/// deleted. Safe to call on an already deleted block.
pub async fn delete_block(
    store: &Arc<dyn ObjectStore>,
    tenant_id: &str,
    block_id: Ulid,
) -> anyhow::Result<()> {
    let prefix = block_prefix(tenant_id, block_id);
    let marker = deletion_mark_path(tenant_id, block_id);

    let mut objects = Vec::new();
    let mut listing = store.list(Some(&prefix));
    while let Some(entry) = listing.next().await {
        let meta = entry.with_context(|| format!("listing objects of block {block_id}"))?;
        objects.push(meta.location);
    }

    let has_marker = objects.iter().any(|p| *p == marker);
    let mut failed = 0usize;

    for path in objects.into_iter().filter(|p| *p != marker) {
        match store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => {
                failed += 1;
                warn!(
                    tenant_id = %tenant_id,
                    block_id = %block_id,
                    path = %path,
                    error = %e,
                    "Failed to delete block object"
                );
            }
        }
    }

    // Only drop the marker once every data object is gone; a partially
    // deleted block must stay marked.
    if failed == 0 && has_marker {
        match store.delete(&marker).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => {
                failed += 1;
                warn!(
                    tenant_id = %tenant_id,
                    block_id = %block_id,
                    path = %marker,
                    error = %e,
                    "Failed to delete block deletion marker"
                );
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("failed to delete {failed} object(s) of block {block_id}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::BlockFixture;
    use object_store::memory::InMemory;

    fn memory_store() -> Arc<dyn ObjectStore> {
        Arc::new(InMemory::new())
    }

    async fn object_count(store: &Arc<dyn ObjectStore>, prefix: &ObjectPath) -> usize {
        store.list(Some(prefix)).count().await
    }

    #[test]
    fn test_parse_block_dir() {
        let id = Ulid::new();
        assert_eq!(parse_block_dir(&id.to_string()), Some(id));
        assert_eq!(parse_block_dir("markers"), None);
        assert_eq!(parse_block_dir("wal"), None);
    }

    #[test]
    fn test_block_paths() {
        let id = Ulid::from_string("01ARZ3NDEKTSV4RRFFQ69G5FAV").unwrap();
        assert_eq!(
            meta_path("acme", id).as_ref(),
            "acme/01ARZ3NDEKTSV4RRFFQ69G5FAV/meta.json"
        );
        assert_eq!(
            deletion_mark_path("acme", id).as_ref(),
            "acme/01ARZ3NDEKTSV4RRFFQ69G5FAV/deletion-mark.json"
        );
    }

    #[tokio::test]
    async fn test_delete_block_removes_all_objects() {
        let store = memory_store();
        let id = Ulid::new();
        BlockFixture::new("acme", id)
            .chunks(3)
            .marked_secs_ago(60)
            .write(&store)
            .await;

        delete_block(&store, "acme", id).await.unwrap();

        assert_eq!(object_count(&store, &block_prefix("acme", id)).await, 0);
    }

    #[tokio::test]
    async fn test_delete_block_is_idempotent() {
        let store = memory_store();
        let id = Ulid::new();
        BlockFixture::new("acme", id).write(&store).await;

        delete_block(&store, "acme", id).await.unwrap();
        // Second delete of a now-empty prefix is a no-op.
        delete_block(&store, "acme", id).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_block_keeps_marker_on_data_failure() {
        let store: Arc<dyn ObjectStore> = Arc::new(crate::testing::FailingStore::new(
            Arc::new(InMemory::new()),
            vec!["chunks".to_string()],
        ));
        let id = Ulid::new();
        BlockFixture::new("acme", id)
            .chunks(1)
            .marked_secs_ago(60)
            .write(&store)
            .await;

        assert!(delete_block(&store, "acme", id).await.is_err());

        // The marker survives so the next run can retry the delete.
        let marker = deletion_mark_path("acme", id);
        assert!(store.head(&marker).await.is_ok());
    }
}
