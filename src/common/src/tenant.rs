//! Tenant discovery over the shared block store.

use std::sync::Arc;

use anyhow::Context;
use object_store::ObjectStore;
use tracing::debug;

use crate::block::marker::tenant_deletion_mark_path;

/// Enumerates tenants present in the store and classifies each one as active
/// or marked for full deletion. A tenant is deleted exactly when its tenant
/// deletion marker object exists, so no tenant can be in both lists.
pub struct TenantScanner {
    store: Arc<dyn ObjectStore>,
}

impl TenantScanner {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Scan the store root. Returns `(active, deleted)` tenant IDs, each
    /// list sorted.
    pub async fn scan(&self) -> anyhow::Result<(Vec<String>, Vec<String>)> {
        let listing = self
            .store
            .list_with_delimiter(None)
            .await
            .context("listing tenants")?;

        let mut active = Vec::new();
        let mut deleted = Vec::new();

        for prefix in &listing.common_prefixes {
            let Some(tenant_id) = prefix.filename() else {
                continue;
            };

            let mark = tenant_deletion_mark_path(tenant_id);
            match self.store.head(&mark).await {
                Ok(_) => deleted.push(tenant_id.to_string()),
                Err(object_store::Error::NotFound { .. }) => active.push(tenant_id.to_string()),
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("reading deletion mark of tenant {tenant_id}")));
                }
            }
        }

        active.sort();
        deleted.sort();

        debug!(
            active = active.len(),
            deleted = deleted.len(),
            "Tenant scan complete"
        );

        Ok((active, deleted))
    }
}
