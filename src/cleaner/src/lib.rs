//! Tessera Blocks Cleaner
//!
//! Periodic reconciliation service enforcing deletion policy over the
//! multi-tenant block store:
//!
//! - For tenants marked for full deletion, every block is hard-deleted.
//! - For active tenants, blocks whose deletion mark is older than the
//!   configured delay are hard-deleted, and partial blocks (missing
//!   metadata) carrying a deletion mark are hard-deleted immediately.
//!
//! One sweep runs at a time: once at startup, then on a fixed interval.
//! Tenants are processed with bounded concurrency and fail independently;
//! a single bad block or bad tenant never stops the rest of the sweep.

pub mod metrics;
pub mod retention;
pub mod service;
pub mod sweep;

pub use metrics::CleanerMetrics;
pub use retention::RetentionCleaner;
pub use service::CleanerService;
pub use sweep::{BlocksCleaner, SweepError, TenantError, TenantFailure};
