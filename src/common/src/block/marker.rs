//! Deletion markers for blocks and tenants.
//!
//! A marker is a small JSON object recording that a block (or a whole tenant)
//! has been designated for removal and when. Markers are written by upstream
//! policy; the cleaner only reads them, except when it removes a block and
//! its marker with it.

use std::sync::Arc;

use chrono::Utc;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use super::{DELETION_MARK_FILENAME, deletion_mark_path};

/// Current version of the deletion mark format.
pub const DELETION_MARK_VERSION: u32 = 1;

/// Per-block deletion marker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionMark {
    /// ID of the marked block.
    pub id: Ulid,
    /// Unix seconds at which the block was marked for deletion.
    pub deletion_time: i64,
    /// Marker format version.
    pub version: u32,
}

impl DeletionMark {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            deletion_time: Utc::now().timestamp(),
            version: DELETION_MARK_VERSION,
        }
    }

    /// Age of the mark in seconds relative to `now` (unix seconds).
    pub fn age_secs(&self, now: i64) -> i64 {
        now - self.deletion_time
    }
}

/// Tenant-wide deletion marker. Its presence classifies the tenant as
/// deleted; every block under the tenant becomes eligible for hard deletion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantDeletionMark {
    /// Unix seconds at which the tenant was marked for deletion.
    pub deletion_time: i64,
}

/// Path of a tenant's deletion marker object.
pub fn tenant_deletion_mark_path(tenant_id: &str) -> ObjectPath {
    ObjectPath::from(format!("{tenant_id}/markers/tenant-{DELETION_MARK_FILENAME}"))
}

/// Errors reading a deletion marker.
///
/// `NotFound` is a normal outcome and must stay distinguishable from I/O
/// errors: absence means "not marked", a read error means "unknown".
#[derive(Debug, Error)]
pub enum MarkerError {
    #[error("deletion mark not found")]
    NotFound,

    #[error("deletion mark corrupted: {reason}")]
    Corrupted { reason: String },

    #[error("reading deletion mark")]
    Store(#[source] object_store::Error),
}

/// Read a block's deletion marker.
pub async fn read_deletion_mark(
    store: &Arc<dyn ObjectStore>,
    tenant_id: &str,
    block_id: Ulid,
) -> Result<DeletionMark, MarkerError> {
    let path = deletion_mark_path(tenant_id, block_id);
    let bytes = match store.get(&path).await {
        Ok(result) => result.bytes().await.map_err(MarkerError::Store)?,
        Err(object_store::Error::NotFound { .. }) => return Err(MarkerError::NotFound),
        Err(e) => return Err(MarkerError::Store(e)),
    };

    let mark: DeletionMark =
        serde_json::from_slice(&bytes).map_err(|e| MarkerError::Corrupted {
            reason: e.to_string(),
        })?;

    if mark.version != DELETION_MARK_VERSION {
        return Err(MarkerError::Corrupted {
            reason: format!("unsupported deletion mark version {}", mark.version),
        });
    }

    Ok(mark)
}

/// Write a block's deletion marker. Used by upstream marking and by fixtures.
pub async fn write_deletion_mark(
    store: &Arc<dyn ObjectStore>,
    tenant_id: &str,
    mark: &DeletionMark,
) -> anyhow::Result<()> {
    let path = deletion_mark_path(tenant_id, mark.id);
    let bytes = serde_json::to_vec(mark)?;
    store.put(&path, bytes.into()).await?;
    Ok(())
}

/// Write a tenant's deletion marker, classifying it as deleted.
pub async fn write_tenant_deletion_mark(
    store: &Arc<dyn ObjectStore>,
    tenant_id: &str,
) -> anyhow::Result<()> {
    let mark = TenantDeletionMark {
        deletion_time: Utc::now().timestamp(),
    };
    let bytes = serde_json::to_vec(&mark)?;
    store.put(&tenant_deletion_mark_path(tenant_id), bytes.into()).await?;
    Ok(())
}
