//! Test support: block fixtures and a failure-injecting store wrapper.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use object_store::path::Path as ObjectPath;
use object_store::{
    GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore, PutMultipartOpts,
    PutOptions, PutPayload, PutResult, Result,
};
use ulid::Ulid;

use crate::block::marker::{DELETION_MARK_VERSION, DeletionMark, write_deletion_mark};
use crate::block::{BlockMeta, META_VERSION, block_prefix, meta_path};

/// Builder writing a synthetic block into an object store.
///
/// By default the block is complete: a parseable `meta.json`, an index
/// object, and no deletion mark.
pub struct BlockFixture {
    tenant_id: String,
    id: Ulid,
    meta: bool,
    corrupt_meta: bool,
    chunks: usize,
    marked_secs_ago: Option<u64>,
}

impl BlockFixture {
    pub fn new(tenant_id: &str, id: Ulid) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            id,
            meta: true,
            corrupt_meta: false,
            chunks: 0,
            marked_secs_ago: None,
        }
    }

    /// Skip writing `meta.json`, producing a partial block.
    pub fn without_meta(mut self) -> Self {
        self.meta = false;
        self
    }

    /// Write an unparseable `meta.json`, producing a corrupted partial block.
    pub fn corrupt_meta(mut self) -> Self {
        self.corrupt_meta = true;
        self
    }

    /// Number of chunk objects to write.
    pub fn chunks(mut self, chunks: usize) -> Self {
        self.chunks = chunks;
        self
    }

    /// Attach a deletion mark of the given age.
    pub fn marked_secs_ago(mut self, secs: u64) -> Self {
        self.marked_secs_ago = Some(secs);
        self
    }

    pub async fn write(self, store: &Arc<dyn ObjectStore>) {
        let prefix = block_prefix(&self.tenant_id, self.id);

        if self.corrupt_meta {
            store
                .put(&meta_path(&self.tenant_id, self.id), b"{ not meta".to_vec().into())
                .await
                .unwrap();
        } else if self.meta {
            let meta = BlockMeta {
                id: self.id,
                min_time: 0,
                max_time: 3_600_000,
                version: META_VERSION,
            };
            store
                .put(
                    &meta_path(&self.tenant_id, self.id),
                    serde_json::to_vec(&meta).unwrap().into(),
                )
                .await
                .unwrap();
        }

        store
            .put(
                &ObjectPath::from(format!("{}/index", prefix.as_ref())),
                b"index".to_vec().into(),
            )
            .await
            .unwrap();

        for chunk in 0..self.chunks {
            store
                .put(
                    &ObjectPath::from(format!("{}/chunks/{:06}", prefix.as_ref(), chunk + 1)),
                    b"chunk-data".to_vec().into(),
                )
                .await
                .unwrap();
        }

        if let Some(secs) = self.marked_secs_ago {
            let mark = DeletionMark {
                id: self.id,
                deletion_time: Utc::now().timestamp() - secs as i64,
                version: DELETION_MARK_VERSION,
            };
            write_deletion_mark(store, &self.tenant_id, &mark).await.unwrap();
        }
    }
}

/// Delegating [`ObjectStore`] that fails `delete` for any path containing one
/// of the configured substrings. Everything else passes through untouched.
#[derive(Debug)]
pub struct FailingStore {
    inner: Arc<dyn ObjectStore>,
    fail_delete_substrings: Mutex<Vec<String>>,
    fail_list_substrings: Mutex<Vec<String>>,
}

impl FailingStore {
    pub fn new(inner: Arc<dyn ObjectStore>, fail_delete_substrings: Vec<String>) -> Self {
        Self {
            inner,
            fail_delete_substrings: Mutex::new(fail_delete_substrings),
            fail_list_substrings: Mutex::new(Vec::new()),
        }
    }

    /// Also fail `list_with_delimiter` for prefixes containing one of the
    /// given substrings. An empty substring fails the root listing.
    pub fn with_list_failures(self, fail_list_substrings: Vec<String>) -> Self {
        *self.fail_list_substrings.lock().unwrap() = fail_list_substrings;
        self
    }

    /// Stop injecting failures, e.g. to let a later run succeed.
    pub fn clear_delete_failures(&self) {
        self.fail_delete_substrings.lock().unwrap().clear();
    }
}

impl fmt::Display for FailingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FailingStore({})", self.inner)
    }
}

#[async_trait]
impl ObjectStore for FailingStore {
    async fn put_opts(
        &self,
        location: &ObjectPath,
        payload: PutPayload,
        opts: PutOptions,
    ) -> Result<PutResult> {
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &ObjectPath,
        opts: PutMultipartOpts,
    ) -> Result<Box<dyn MultipartUpload>> {
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(&self, location: &ObjectPath, options: GetOptions) -> Result<GetResult> {
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &ObjectPath) -> Result<()> {
        let injected = self
            .fail_delete_substrings
            .lock()
            .unwrap()
            .iter()
            .any(|fragment| location.as_ref().contains(fragment.as_str()));
        if injected {
            return Err(object_store::Error::Generic {
                store: "FailingStore",
                source: Box::new(std::io::Error::other(format!(
                    "injected delete failure for {location}"
                ))),
            });
        }
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&ObjectPath>) -> BoxStream<'static, Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(&self, prefix: Option<&ObjectPath>) -> Result<ListResult> {
        let prefix_str = prefix.map(|p| p.as_ref().to_string()).unwrap_or_default();
        let injected = self.fail_list_substrings.lock().unwrap().iter().any(|fragment| {
            if fragment.is_empty() {
                prefix.is_none()
            } else {
                prefix_str.contains(fragment.as_str())
            }
        });
        if injected {
            return Err(object_store::Error::Generic {
                store: "FailingStore",
                source: Box::new(std::io::Error::other(format!(
                    "injected listing failure for '{prefix_str}'"
                ))),
            });
        }
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &ObjectPath, to: &ObjectPath) -> Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &ObjectPath, to: &ObjectPath) -> Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}
