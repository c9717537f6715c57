//! Per-tenant block metadata synchronization.
//!
//! The fetcher lists every block-shaped directory under a tenant, loads each
//! block's `meta.json` with bounded concurrency, and keeps a local JSON cache
//! of fetched metadata under the cleaner's data directory so repeated runs
//! don't re-read unchanged objects. Blocks whose metadata is missing or
//! unreadable are reported separately as *partial*, with the specific reason
//! preserved; transport failures abort the whole sync instead, so a flaky
//! backend cannot silently shrink the accepted view.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use ulid::Ulid;

use super::{BlockMeta, META_VERSION, meta_path, parse_block_dir};

/// Why a block failed to yield complete metadata.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum MetaSyncError {
    /// The metadata object does not exist. The only partiality cause that is
    /// safe grounds for reconciliation.
    #[error("metadata object not found")]
    NotFound,

    /// The metadata object exists but cannot be used.
    #[error("metadata corrupted: {reason}")]
    Corrupted { reason: String },
}

/// Systemic failure of a metadata sync. Fatal for the tenant's run.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("metadata sync canceled")]
    Canceled,

    #[error("listing blocks of tenant {tenant_id}")]
    List {
        tenant_id: String,
        #[source]
        source: object_store::Error,
    },

    #[error("reading metadata of block {block_id}")]
    Meta {
        block_id: Ulid,
        #[source]
        source: object_store::Error,
    },

    #[error("reading deletion mark of block {block_id}")]
    Marker {
        block_id: Ulid,
        #[source]
        source: object_store::Error,
    },

    #[error("metadata cache at {path}")]
    Cache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A filter applied to the fetched metadata view before it is returned.
#[async_trait]
pub trait MetadataFilter: Send + Sync {
    async fn filter(
        &self,
        token: &CancellationToken,
        metas: &mut HashMap<Ulid, BlockMeta>,
    ) -> Result<(), FetchError>;
}

/// Result of one metadata sync.
#[derive(Debug)]
pub struct FetchResult {
    /// Complete blocks that survived all filters.
    pub metas: HashMap<Ulid, BlockMeta>,
    /// Partial blocks and why each one is partial.
    pub partials: HashMap<Ulid, MetaSyncError>,
}

enum LoadOutcome {
    Complete(BlockMeta),
    Partial(MetaSyncError),
}

/// Lists and loads block metadata for one tenant.
pub struct MetaFetcher {
    store: Arc<dyn ObjectStore>,
    tenant_id: String,
    cache_dir: PathBuf,
    concurrency: usize,
    filters: Vec<Arc<dyn MetadataFilter>>,
}

impl MetaFetcher {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        tenant_id: &str,
        data_dir: &Path,
        concurrency: usize,
        filters: Vec<Arc<dyn MetadataFilter>>,
    ) -> Self {
        Self {
            store,
            tenant_id: tenant_id.to_string(),
            cache_dir: data_dir.join("meta-cache").join(tenant_id),
            concurrency,
            filters,
        }
    }

    /// Run one metadata sync for the tenant.
    pub async fn fetch(&self, token: &CancellationToken) -> Result<FetchResult, FetchError> {
        let prefix = ObjectPath::from(self.tenant_id.as_str());
        let listing = self
            .store
            .list_with_delimiter(Some(&prefix))
            .await
            .map_err(|e| FetchError::List {
                tenant_id: self.tenant_id.clone(),
                source: e,
            })?;

        let block_ids: Vec<Ulid> = listing
            .common_prefixes
            .iter()
            .filter_map(|p| p.filename().and_then(parse_block_dir))
            .collect();

        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| FetchError::Cache {
                path: self.cache_dir.clone(),
                source: e,
            })?;

        let loaded: Vec<(Ulid, LoadOutcome)> = stream::iter(block_ids.iter().copied())
            .map(|id| self.load_meta(token, id))
            .buffer_unordered(self.concurrency.max(1))
            .try_collect()
            .await?;

        let mut metas = HashMap::new();
        let mut partials = HashMap::new();
        for (id, outcome) in loaded {
            match outcome {
                LoadOutcome::Complete(meta) => {
                    metas.insert(id, meta);
                }
                LoadOutcome::Partial(reason) => {
                    partials.insert(id, reason);
                }
            }
        }

        self.prune_cache(&block_ids).await;

        for filter in &self.filters {
            filter.filter(token, &mut metas).await?;
        }

        debug!(
            tenant_id = %self.tenant_id,
            blocks = metas.len(),
            partials = partials.len(),
            "Block metadata sync complete"
        );

        Ok(FetchResult { metas, partials })
    }

    async fn load_meta(
        &self,
        token: &CancellationToken,
        block_id: Ulid,
    ) -> Result<(Ulid, LoadOutcome), FetchError> {
        if token.is_cancelled() {
            return Err(FetchError::Canceled);
        }

        let cache_file = self.cache_dir.join(format!("{block_id}.json"));
        match tokio::fs::read(&cache_file).await {
            Ok(bytes) => {
                if let Ok(meta) = serde_json::from_slice::<BlockMeta>(&bytes)
                    && meta.version == META_VERSION
                    && meta.id == block_id
                {
                    return Ok((block_id, LoadOutcome::Complete(meta)));
                }
                // A cache entry that doesn't parse is discarded and refetched;
                // only the store decides whether a block is corrupted.
                let _ = tokio::fs::remove_file(&cache_file).await;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(FetchError::Cache {
                    path: cache_file,
                    source: e,
                });
            }
        }

        let path = meta_path(&self.tenant_id, block_id);
        let bytes = match self.store.get(&path).await {
            Ok(result) => match result.bytes().await {
                Ok(bytes) => bytes,
                Err(e) => return Err(FetchError::Meta { block_id, source: e }),
            },
            Err(object_store::Error::NotFound { .. }) => {
                return Ok((block_id, LoadOutcome::Partial(MetaSyncError::NotFound)));
            }
            Err(e) => return Err(FetchError::Meta { block_id, source: e }),
        };

        let meta: BlockMeta = match serde_json::from_slice(&bytes) {
            Ok(meta) => meta,
            Err(e) => {
                return Ok((
                    block_id,
                    LoadOutcome::Partial(MetaSyncError::Corrupted {
                        reason: e.to_string(),
                    }),
                ));
            }
        };

        if meta.version != META_VERSION {
            return Ok((
                block_id,
                LoadOutcome::Partial(MetaSyncError::Corrupted {
                    reason: format!("unsupported metadata version {}", meta.version),
                }),
            ));
        }
        if meta.id != block_id {
            return Ok((
                block_id,
                LoadOutcome::Partial(MetaSyncError::Corrupted {
                    reason: format!("metadata id {} does not match block directory", meta.id),
                }),
            ));
        }

        if let Err(e) = tokio::fs::write(&cache_file, &bytes).await {
            warn!(
                tenant_id = %self.tenant_id,
                block_id = %block_id,
                error = %e,
                "Failed to cache block metadata"
            );
        }

        Ok((block_id, LoadOutcome::Complete(meta)))
    }

    /// Drop cache entries for blocks that no longer exist in the store.
    async fn prune_cache(&self, live: &[Ulid]) {
        let live: HashSet<String> = live.iter().map(|id| format!("{id}.json")).collect();

        let mut dir = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!(
                    tenant_id = %self.tenant_id,
                    error = %e,
                    "Failed to open metadata cache directory"
                );
                return;
            }
        };

        loop {
            match dir.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name();
                    if !live.contains(name.to_string_lossy().as_ref()) {
                        let _ = tokio::fs::remove_file(entry.path()).await;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        tenant_id = %self.tenant_id,
                        error = %e,
                        "Failed to scan metadata cache directory"
                    );
                    break;
                }
            }
        }
    }
}
