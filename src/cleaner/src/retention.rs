//! Retention-based deletion of well-formed blocks.
//!
//! Deletes every block whose deletion mark has outlived the configured
//! delay. Per-block failures are counted and logged but never abort the
//! pass; only cancellation does.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use object_store::ObjectStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use ulid::Ulid;

use common::block::{DeletionMark, delete_block};

use crate::metrics::CleanerMetrics;
use crate::sweep::TenantError;

pub struct RetentionCleaner {
    store: Arc<dyn ObjectStore>,
    delay: Duration,
    metrics: CleanerMetrics,
}

impl RetentionCleaner {
    pub fn new(store: Arc<dyn ObjectStore>, delay: Duration, metrics: CleanerMetrics) -> Self {
        Self {
            store,
            delay,
            metrics,
        }
    }

    /// Delete the blocks in `marked` whose mark age exceeds the delay.
    ///
    /// `marked` is the deletion-mark map collected by the metadata filter
    /// during the same run, so every entry refers to a well-formed block.
    pub async fn delete_marked_blocks(
        &self,
        token: &CancellationToken,
        tenant_id: &str,
        marked: &HashMap<Ulid, DeletionMark>,
    ) -> Result<(), TenantError> {
        let now = Utc::now().timestamp();

        // ULIDs sort by creation time, so deletion proceeds oldest-first.
        let mut block_ids: Vec<Ulid> = marked.keys().copied().collect();
        block_ids.sort();

        for block_id in block_ids {
            if token.is_cancelled() {
                return Err(TenantError::Canceled);
            }

            let mark = &marked[&block_id];
            if mark.age_secs(now) <= self.delay.as_secs() as i64 {
                continue;
            }

            match delete_block(&self.store, tenant_id, block_id).await {
                Ok(()) => {
                    self.metrics.record_block_cleaned();
                    info!(
                        tenant_id = %tenant_id,
                        block_id = %block_id,
                        "Deleted block marked for deletion"
                    );
                }
                Err(e) => {
                    self.metrics.record_block_failed();
                    warn!(
                        tenant_id = %tenant_id,
                        block_id = %block_id,
                        error = %e,
                        "Failed to delete block marked for deletion"
                    );
                }
            }
        }

        Ok(())
    }
}
