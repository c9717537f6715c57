//! Sweep orchestration.
//!
//! One sweep classifies every tenant in the store and fans the work out over
//! a bounded pool: tenants marked for full deletion get every block erased,
//! active tenants get retention cleanup plus partial-block reconciliation.
//! Tenants fail independently; the sweep reports an aggregate error at the
//! end instead of aborting on the first bad tenant.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use futures::{StreamExt, stream};
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use common::block::marker::{MarkerError, read_deletion_mark};
use common::block::{
    DeletionMarkFilter, FetchError, MetaFetcher, MetaSyncError, MetadataFilter, delete_block,
    parse_block_dir,
};
use common::config::CleanerConfig;
use common::tenant::TenantScanner;

use crate::metrics::CleanerMetrics;
use crate::retention::RetentionCleaner;

/// Failure of a single tenant's cleanup.
#[derive(Debug, Error)]
pub enum TenantError {
    #[error("tenant cleanup canceled")]
    Canceled,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl TenantError {
    fn wrap(self, msg: &'static str) -> Self {
        match self {
            TenantError::Canceled => TenantError::Canceled,
            TenantError::Failed(e) => TenantError::Failed(e.context(msg)),
        }
    }
}

/// A tenant's failure together with its identity, for attribution.
#[derive(Debug)]
pub struct TenantFailure {
    pub tenant_id: String,
    pub error: TenantError,
}

/// Outcome of one sweep.
#[derive(Debug, Error)]
pub enum SweepError {
    /// Tenant discovery failed; nothing was attempted.
    #[error("discovering tenants")]
    Discovery(#[source] anyhow::Error),

    /// The run was canceled from outside. Neither success nor failure.
    #[error("sweep canceled")]
    Canceled,

    /// One or more tenants failed; the rest were still processed.
    #[error("cleanup failed for {} tenant(s)", failures.len())]
    TenantFailures { failures: Vec<TenantFailure> },
}

/// Drives one cleanup sweep across all tenants.
pub struct BlocksCleaner {
    cfg: CleanerConfig,
    store: Arc<dyn ObjectStore>,
    scanner: TenantScanner,
    metrics: CleanerMetrics,
}

impl BlocksCleaner {
    pub fn new(cfg: CleanerConfig, store: Arc<dyn ObjectStore>, metrics: CleanerMetrics) -> Self {
        let scanner = TenantScanner::new(store.clone());
        Self {
            cfg,
            store,
            scanner,
            metrics,
        }
    }

    pub fn metrics(&self) -> &CleanerMetrics {
        &self.metrics
    }

    /// Run one sweep over every tenant in the store.
    pub async fn run(&self, token: &CancellationToken) -> Result<(), SweepError> {
        let (active, deleted) = self.scanner.scan().await.map_err(SweepError::Discovery)?;

        let deleted_set: HashSet<String> = deleted.iter().cloned().collect();
        let mut tenants = active;
        tenants.extend(deleted);

        info!(
            tenants = tenants.len(),
            marked_deleted = deleted_set.len(),
            "Sweeping tenants"
        );

        let results: Vec<(String, Result<(), TenantError>)> =
            stream::iter(tenants.into_iter().map(|tenant_id| {
                let deleted_set = &deleted_set;
                async move {
                    let result = if deleted_set.contains(&tenant_id) {
                        self.erase_tenant(token, &tenant_id)
                            .await
                            .map_err(|e| e.wrap("erasing tenant marked for deletion"))
                    } else {
                        self.clean_tenant(token, &tenant_id)
                            .await
                            .map_err(|e| e.wrap("cleaning tenant blocks"))
                    };
                    (tenant_id, result)
                }
            }))
            .buffer_unordered(self.cfg.cleanup_concurrency.max(1))
            .collect()
            .await;

        let mut failures = Vec::new();
        for (tenant_id, result) in results {
            match result {
                Ok(()) => {}
                // Cancellation is surfaced once for the whole run below.
                Err(TenantError::Canceled) => {}
                Err(e) => {
                    error!(tenant_id = %tenant_id, error = %e, "Tenant cleanup failed");
                    failures.push(TenantFailure {
                        tenant_id,
                        error: e,
                    });
                }
            }
        }

        if token.is_cancelled() {
            return Err(SweepError::Canceled);
        }
        if !failures.is_empty() {
            return Err(SweepError::TenantFailures { failures });
        }
        Ok(())
    }

    /// Hard-delete every block of a tenant marked for full deletion.
    ///
    /// A failing block is counted and skipped so the rest of the tenant
    /// still gets erased; the failure count is reported at the end.
    async fn erase_tenant(
        &self,
        token: &CancellationToken,
        tenant_id: &str,
    ) -> Result<(), TenantError> {
        info!(tenant_id = %tenant_id, "Erasing blocks of tenant marked for deletion");

        let listing = self
            .store
            .list_with_delimiter(Some(&ObjectPath::from(tenant_id)))
            .await
            .map_err(|e| {
                TenantError::Failed(anyhow::Error::new(e).context("listing tenant blocks"))
            })?;

        let mut block_ids: Vec<Ulid> = listing
            .common_prefixes
            .iter()
            .filter_map(|p| p.filename().and_then(parse_block_dir))
            .collect();
        block_ids.sort();

        let mut deleted = 0usize;
        let mut failed = 0usize;

        for block_id in block_ids {
            if token.is_cancelled() {
                return Err(TenantError::Canceled);
            }

            match delete_block(&self.store, tenant_id, block_id).await {
                Ok(()) => {
                    deleted += 1;
                    self.metrics.record_block_cleaned();
                    info!(tenant_id = %tenant_id, block_id = %block_id, "Deleted block");
                }
                Err(e) => {
                    failed += 1;
                    self.metrics.record_block_failed();
                    warn!(
                        tenant_id = %tenant_id,
                        block_id = %block_id,
                        error = %e,
                        "Failed to delete block"
                    );
                }
            }
        }

        if failed > 0 {
            return Err(TenantError::Failed(anyhow::anyhow!(
                "failed to delete {failed} of {} blocks",
                deleted + failed
            )));
        }

        info!(
            tenant_id = %tenant_id,
            deleted_blocks = deleted,
            "Finished erasing tenant"
        );
        Ok(())
    }

    /// Clean an active tenant: retention cleanup of marked well-formed
    /// blocks, then best-effort reconciliation of partial blocks.
    async fn clean_tenant(
        &self,
        token: &CancellationToken,
        tenant_id: &str,
    ) -> Result<(), TenantError> {
        debug!(tenant_id = %tenant_id, "Cleaning blocks of active tenant");

        let filter = Arc::new(DeletionMarkFilter::new(
            self.store.clone(),
            tenant_id,
            self.cfg.deletion_delay,
            self.cfg.meta_sync_concurrency,
        ));
        let fetcher = MetaFetcher::new(
            self.store.clone(),
            tenant_id,
            Path::new(&self.cfg.data_dir),
            self.cfg.meta_sync_concurrency,
            vec![filter.clone() as Arc<dyn MetadataFilter>],
        );

        let fetched = fetcher.fetch(token).await.map_err(|e| match e {
            FetchError::Canceled => TenantError::Canceled,
            e => TenantError::Failed(anyhow::Error::new(e).context("syncing block metadata")),
        })?;

        let retention = RetentionCleaner::new(
            self.store.clone(),
            self.cfg.deletion_delay,
            self.metrics.clone(),
        );
        retention
            .delete_marked_blocks(token, tenant_id, &filter.marked())
            .await?;

        // Best effort by contract: a stuck partial block is no worse than
        // the status quo and must not fail the tenant.
        if !fetched.partials.is_empty() {
            self.clean_partial_blocks(token, tenant_id, &fetched.partials)
                .await;
        }

        Ok(())
    }

    /// Reconcile partial blocks: hard-delete those whose metadata object is
    /// missing and that carry a deletion mark, regardless of the mark's age.
    ///
    /// Other partiality causes are left untouched; deleting them could
    /// destroy recoverable data.
    async fn clean_partial_blocks(
        &self,
        token: &CancellationToken,
        tenant_id: &str,
        partials: &HashMap<Ulid, MetaSyncError>,
    ) {
        info!(
            tenant_id = %tenant_id,
            partials = partials.len(),
            "Reconciling partial blocks"
        );

        let mut block_ids: Vec<Ulid> = partials
            .iter()
            .filter(|(_, reason)| matches!(reason, MetaSyncError::NotFound))
            .map(|(id, _)| *id)
            .collect();
        block_ids.sort();

        for block_id in block_ids {
            if token.is_cancelled() {
                return;
            }

            match read_deletion_mark(&self.store, tenant_id, block_id).await {
                Ok(_) => {}
                // No mark: leave the block for a future run, once it either
                // gains valid metadata or gets marked.
                Err(MarkerError::NotFound) => continue,
                Err(e) => {
                    warn!(
                        tenant_id = %tenant_id,
                        block_id = %block_id,
                        error = %e,
                        "Error reading partial block deletion mark"
                    );
                    continue;
                }
            }

            // A block without metadata can never be served, so a confirmed
            // mark deletes it without waiting out the retention delay.
            match delete_block(&self.store, tenant_id, block_id).await {
                Ok(()) => {
                    self.metrics.record_block_cleaned();
                    info!(
                        tenant_id = %tenant_id,
                        block_id = %block_id,
                        "Deleted partial block marked for deletion"
                    );
                }
                Err(e) => {
                    self.metrics.record_block_failed();
                    warn!(
                        tenant_id = %tenant_id,
                        block_id = %block_id,
                        error = %e,
                        "Failed to delete partial block marked for deletion"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::block::block_prefix;
    use common::block::marker::write_tenant_deletion_mark;
    use common::testing::{BlockFixture, FailingStore};
    use object_store::memory::InMemory;
    use std::time::Duration;

    const DAY: u64 = 24 * 3600;

    fn test_config(data_dir: &Path) -> CleanerConfig {
        CleanerConfig {
            enabled: true,
            data_dir: data_dir.to_string_lossy().into_owned(),
            meta_sync_concurrency: 4,
            deletion_delay: Duration::from_secs(7 * DAY),
            cleanup_interval: Duration::from_secs(900),
            cleanup_concurrency: 2,
        }
    }

    fn cleaner(store: Arc<dyn ObjectStore>, data_dir: &Path) -> BlocksCleaner {
        BlocksCleaner::new(test_config(data_dir), store, CleanerMetrics::new())
    }

    fn memory_store() -> Arc<dyn ObjectStore> {
        Arc::new(InMemory::new())
    }

    async fn block_exists(store: &Arc<dyn ObjectStore>, tenant_id: &str, id: Ulid) -> bool {
        store
            .list(Some(&block_prefix(tenant_id, id)))
            .count()
            .await
            > 0
    }

    async fn block_dir_count(store: &Arc<dyn ObjectStore>, tenant_id: &str) -> usize {
        store
            .list_with_delimiter(Some(&ObjectPath::from(tenant_id)))
            .await
            .unwrap()
            .common_prefixes
            .iter()
            .filter_map(|p| p.filename().and_then(parse_block_dir))
            .count()
    }

    fn failed_tenants(err: SweepError) -> Vec<String> {
        match err {
            SweepError::TenantFailures { failures } => {
                failures.into_iter().map(|f| f.tenant_id).collect()
            }
            other => panic!("expected tenant failures, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_expired_mark_is_deleted_and_unmarked_block_retained() {
        let store = memory_store();
        let dir = tempfile::tempdir().unwrap();
        let b1 = Ulid::new();
        let b2 = Ulid::new();
        BlockFixture::new("alpha", b1)
            .marked_secs_ago(10 * DAY)
            .write(&store)
            .await;
        BlockFixture::new("alpha", b2).write(&store).await;

        let cleaner = cleaner(store.clone(), dir.path());
        cleaner.run(&CancellationToken::new()).await.unwrap();

        assert!(!block_exists(&store, "alpha", b1).await);
        assert!(block_exists(&store, "alpha", b2).await);
        assert_eq!(cleaner.metrics().blocks_cleaned(), 1);
        assert_eq!(cleaner.metrics().blocks_failed(), 0);
    }

    #[tokio::test]
    async fn test_mark_younger_than_delay_is_retained() {
        let store = memory_store();
        let dir = tempfile::tempdir().unwrap();
        let id = Ulid::new();
        BlockFixture::new("alpha", id)
            .marked_secs_ago(DAY)
            .write(&store)
            .await;

        let cleaner = cleaner(store.clone(), dir.path());
        cleaner.run(&CancellationToken::new()).await.unwrap();

        assert!(block_exists(&store, "alpha", id).await);
        assert_eq!(cleaner.metrics().blocks_cleaned(), 0);
    }

    #[tokio::test]
    async fn test_deleted_tenant_is_fully_erased() {
        let store = memory_store();
        let dir = tempfile::tempdir().unwrap();
        let c1 = Ulid::new();
        let c2 = Ulid::new();
        BlockFixture::new("bravo", c1).chunks(2).write(&store).await;
        BlockFixture::new("bravo", c2).write(&store).await;
        write_tenant_deletion_mark(&store, "bravo").await.unwrap();

        let cleaner = cleaner(store.clone(), dir.path());
        cleaner.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(block_dir_count(&store, "bravo").await, 0);
        assert_eq!(cleaner.metrics().blocks_cleaned(), 2);
    }

    #[tokio::test]
    async fn test_failed_block_delete_reports_tenant_failure() {
        let inner = Arc::new(InMemory::new());
        let c1 = Ulid::new();
        let c2 = Ulid::new();
        let store: Arc<dyn ObjectStore> =
            Arc::new(FailingStore::new(inner, vec![c2.to_string()]));
        BlockFixture::new("bravo", c1).write(&store).await;
        BlockFixture::new("bravo", c2).write(&store).await;
        write_tenant_deletion_mark(&store, "bravo").await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let cleaner = cleaner(store.clone(), dir.path());
        let err = cleaner.run(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(failed_tenants(err), vec!["bravo".to_string()]);
        assert!(!block_exists(&store, "bravo", c1).await);
        assert!(block_exists(&store, "bravo", c2).await);
        assert_eq!(cleaner.metrics().blocks_cleaned(), 1);
        assert_eq!(cleaner.metrics().blocks_failed(), 1);
    }

    #[tokio::test]
    async fn test_tenant_failure_does_not_block_other_tenants() {
        let inner = Arc::new(InMemory::new());
        let bad = Ulid::new();
        let good = Ulid::new();
        let store: Arc<dyn ObjectStore> =
            Arc::new(FailingStore::new(inner, vec![bad.to_string()]));
        BlockFixture::new("bravo", bad).write(&store).await;
        write_tenant_deletion_mark(&store, "bravo").await.unwrap();
        BlockFixture::new("alpha", good)
            .marked_secs_ago(10 * DAY)
            .write(&store)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cleaner = cleaner(store.clone(), dir.path());
        let err = cleaner.run(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(failed_tenants(err), vec!["bravo".to_string()]);
        // The failing tenant didn't stop alpha's retention cleanup.
        assert!(!block_exists(&store, "alpha", good).await);
    }

    #[tokio::test]
    async fn test_partial_block_with_mark_bypasses_the_delay() {
        let store = memory_store();
        let dir = tempfile::tempdir().unwrap();
        let p1 = Ulid::new();
        BlockFixture::new("charlie", p1)
            .without_meta()
            .chunks(1)
            .marked_secs_ago(60)
            .write(&store)
            .await;

        let cleaner = cleaner(store.clone(), dir.path());
        cleaner.run(&CancellationToken::new()).await.unwrap();

        assert!(!block_exists(&store, "charlie", p1).await);
        assert_eq!(cleaner.metrics().blocks_cleaned(), 1);
    }

    #[tokio::test]
    async fn test_partial_block_without_mark_is_left_alone() {
        let store = memory_store();
        let dir = tempfile::tempdir().unwrap();
        let p1 = Ulid::new();
        BlockFixture::new("charlie", p1)
            .without_meta()
            .chunks(1)
            .write(&store)
            .await;

        let cleaner = cleaner(store.clone(), dir.path());
        cleaner.run(&CancellationToken::new()).await.unwrap();

        assert!(block_exists(&store, "charlie", p1).await);
        assert_eq!(cleaner.metrics().blocks_cleaned(), 0);
    }

    #[tokio::test]
    async fn test_corrupted_partial_block_is_never_deleted() {
        // Corruption is not "metadata missing": the block might be
        // recoverable, so even an expired mark must not delete it.
        let store = memory_store();
        let dir = tempfile::tempdir().unwrap();
        let p1 = Ulid::new();
        BlockFixture::new("charlie", p1)
            .corrupt_meta()
            .chunks(1)
            .marked_secs_ago(10 * DAY)
            .write(&store)
            .await;

        let cleaner = cleaner(store.clone(), dir.path());
        cleaner.run(&CancellationToken::new()).await.unwrap();

        assert!(block_exists(&store, "charlie", p1).await);
        assert_eq!(cleaner.metrics().blocks_cleaned(), 0);
    }

    #[tokio::test]
    async fn test_partial_block_delete_failure_does_not_fail_the_tenant() {
        let inner = Arc::new(InMemory::new());
        let p1 = Ulid::new();
        let store: Arc<dyn ObjectStore> =
            Arc::new(FailingStore::new(inner, vec![p1.to_string()]));
        BlockFixture::new("charlie", p1)
            .without_meta()
            .chunks(1)
            .marked_secs_ago(60)
            .write(&store)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cleaner = cleaner(store.clone(), dir.path());

        // Reconciliation is best-effort: the failed delete is counted but
        // the run still succeeds.
        cleaner.run(&CancellationToken::new()).await.unwrap();
        assert!(block_exists(&store, "charlie", p1).await);
        assert_eq!(cleaner.metrics().blocks_failed(), 1);
    }

    #[tokio::test]
    async fn test_clean_store_run_is_a_noop() {
        let store = memory_store();
        let dir = tempfile::tempdir().unwrap();
        BlockFixture::new("alpha", Ulid::new()).write(&store).await;

        let cleaner = cleaner(store.clone(), dir.path());
        cleaner.run(&CancellationToken::new()).await.unwrap();
        cleaner.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(cleaner.metrics().blocks_cleaned(), 0);
        assert_eq!(cleaner.metrics().blocks_failed(), 0);
    }

    #[tokio::test]
    async fn test_discovery_failure_aborts_the_run() {
        let store: Arc<dyn ObjectStore> = Arc::new(
            FailingStore::new(Arc::new(InMemory::new()), vec![])
                .with_list_failures(vec![String::new()]),
        );
        BlockFixture::new("alpha", Ulid::new()).write(&store).await;

        let dir = tempfile::tempdir().unwrap();
        let cleaner = cleaner(store, dir.path());
        let err = cleaner.run(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, SweepError::Discovery(_)));
    }

    #[tokio::test]
    async fn test_tenant_listing_failure_is_isolated() {
        let store: Arc<dyn ObjectStore> = Arc::new(
            FailingStore::new(Arc::new(InMemory::new()), vec![])
                .with_list_failures(vec!["bravo".to_string()]),
        );
        let good = Ulid::new();
        BlockFixture::new("alpha", good)
            .marked_secs_ago(10 * DAY)
            .write(&store)
            .await;
        BlockFixture::new("bravo", Ulid::new()).write(&store).await;

        let dir = tempfile::tempdir().unwrap();
        let cleaner = cleaner(store.clone(), dir.path());
        let err = cleaner.run(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(failed_tenants(err), vec!["bravo".to_string()]);
        assert!(!block_exists(&store, "alpha", good).await);
    }

    #[tokio::test]
    async fn test_canceled_run_reports_canceled() {
        let store = memory_store();
        let dir = tempfile::tempdir().unwrap();
        BlockFixture::new("bravo", Ulid::new()).write(&store).await;
        write_tenant_deletion_mark(&store, "bravo").await.unwrap();

        let token = CancellationToken::new();
        token.cancel();

        let cleaner = cleaner(store.clone(), dir.path());
        let err = cleaner.run(&token).await.unwrap_err();

        assert!(matches!(err, SweepError::Canceled));
        // Nothing was deleted after the cancellation point.
        assert_eq!(block_dir_count(&store, "bravo").await, 1);
    }

    #[tokio::test]
    async fn test_marker_read_error_skips_only_that_block() {
        // A failing marker read on one partial block must not stop the
        // reconciliation of other partial blocks.
        let store = memory_store();
        let dir = tempfile::tempdir().unwrap();
        let unreadable = Ulid::new();
        let deletable = Ulid::new();

        BlockFixture::new("charlie", unreadable)
            .without_meta()
            .chunks(1)
            .write(&store)
            .await;
        // Corrupted marker: logged and skipped, never deleted.
        store
            .put(
                &common::block::deletion_mark_path("charlie", unreadable),
                b"not json".to_vec().into(),
            )
            .await
            .unwrap();
        BlockFixture::new("charlie", deletable)
            .without_meta()
            .chunks(1)
            .marked_secs_ago(60)
            .write(&store)
            .await;

        let cleaner = cleaner(store.clone(), dir.path());
        cleaner.run(&CancellationToken::new()).await.unwrap();

        assert!(block_exists(&store, "charlie", unreadable).await);
        assert!(!block_exists(&store, "charlie", deletable).await);
    }

    #[tokio::test]
    async fn test_rerun_after_clearing_failures_converges() {
        let inner = Arc::new(InMemory::new());
        let id = Ulid::new();
        let failing = Arc::new(FailingStore::new(inner, vec![id.to_string()]));
        let store: Arc<dyn ObjectStore> = failing.clone();
        BlockFixture::new("bravo", id).write(&store).await;
        write_tenant_deletion_mark(&store, "bravo").await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let cleaner = cleaner(store.clone(), dir.path());
        assert!(cleaner.run(&CancellationToken::new()).await.is_err());
        assert!(block_exists(&store, "bravo", id).await);

        // Deletions are idempotent, so the next run finishes the job.
        failing.clear_delete_failures();
        cleaner.run(&CancellationToken::new()).await.unwrap();
        assert!(!block_exists(&store, "bravo", id).await);
    }
}
