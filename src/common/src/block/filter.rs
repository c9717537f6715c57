//! Deletion-mark aware metadata filtering.
//!
//! The filter reads the deletion marker of every fetched block and records
//! all marks it finds. Blocks whose mark is older than the configured delay
//! are removed from the accepted metadata view: they are scheduled for hard
//! deletion and must no longer be served or compacted. The recorded marks
//! feed the retention deletion path afterwards.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{StreamExt, TryStreamExt, stream};
use object_store::ObjectStore;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use ulid::Ulid;

use super::marker::{DeletionMark, MarkerError, read_deletion_mark};
use super::{BlockMeta, FetchError, MetadataFilter};

pub struct DeletionMarkFilter {
    store: Arc<dyn ObjectStore>,
    tenant_id: String,
    delay: Duration,
    concurrency: usize,
    marked: Mutex<HashMap<Ulid, DeletionMark>>,
}

impl DeletionMarkFilter {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        tenant_id: &str,
        delay: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            tenant_id: tenant_id.to_string(),
            delay,
            concurrency,
            marked: Mutex::new(HashMap::new()),
        }
    }

    /// All deletion marks found during the last filter pass, keyed by block.
    pub fn marked(&self) -> HashMap<Ulid, DeletionMark> {
        self.marked.lock().expect("deletion mark map poisoned").clone()
    }
}

#[async_trait]
impl MetadataFilter for DeletionMarkFilter {
    async fn filter(
        &self,
        token: &CancellationToken,
        metas: &mut HashMap<Ulid, BlockMeta>,
    ) -> Result<(), FetchError> {
        let ids: Vec<Ulid> = metas.keys().copied().collect();

        let marks: Vec<Option<(Ulid, DeletionMark)>> = stream::iter(ids)
            .map(|block_id| async move {
                if token.is_cancelled() {
                    return Err(FetchError::Canceled);
                }
                match read_deletion_mark(&self.store, &self.tenant_id, block_id).await {
                    Ok(mark) => Ok(Some((block_id, mark))),
                    Err(MarkerError::NotFound) => Ok(None),
                    Err(MarkerError::Corrupted { reason }) => {
                        // An unreadable marker is treated as absence; it is
                        // never evidence for deletion.
                        warn!(
                            tenant_id = %self.tenant_id,
                            block_id = %block_id,
                            reason = %reason,
                            "Ignoring corrupted block deletion mark"
                        );
                        Ok(None)
                    }
                    Err(MarkerError::Store(source)) => {
                        Err(FetchError::Marker { block_id, source })
                    }
                }
            })
            .buffer_unordered(self.concurrency.max(1))
            .try_collect()
            .await?;

        let now = Utc::now().timestamp();
        let mut marked = self.marked.lock().expect("deletion mark map poisoned");
        marked.clear();
        marked.extend(marks.into_iter().flatten());

        for (block_id, mark) in marked.iter() {
            if mark.age_secs(now) > self.delay.as_secs() as i64 {
                metas.remove(block_id);
            }
        }

        Ok(())
    }
}
