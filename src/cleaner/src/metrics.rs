//! Cleaner metrics.
//!
//! The only shared mutable state of a sweep: a set of atomic counters
//! incremented from the bounded tenant worker pool, plus a gauge carrying
//! the timestamp of the last fully successful run.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

/// Thread-safe counters for cleanup runs and block deletions.
#[derive(Debug, Clone)]
pub struct CleanerMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    /// Cleanup runs started.
    runs_started: AtomicU64,
    /// Cleanup runs completed successfully.
    runs_completed: AtomicU64,
    /// Cleanup runs failed. Canceled runs count as neither.
    runs_failed: AtomicU64,
    /// Blocks hard-deleted.
    blocks_cleaned: AtomicU64,
    /// Blocks that failed to delete.
    blocks_failed: AtomicU64,
    /// Unix seconds of the last successful run, 0 until the first one.
    last_successful_run_unix: AtomicU64,
}

impl Default for CleanerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CleanerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::default()),
        }
    }

    pub fn record_run_started(&self) {
        self.inner.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_completed(&self) {
        self.inner.runs_completed.fetch_add(1, Ordering::Relaxed);
        self.inner
            .last_successful_run_unix
            .store(Utc::now().timestamp() as u64, Ordering::Relaxed);
    }

    pub fn record_run_failed(&self) {
        self.inner.runs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_block_cleaned(&self) {
        self.inner.blocks_cleaned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_block_failed(&self) {
        self.inner.blocks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn runs_started(&self) -> u64 {
        self.inner.runs_started.load(Ordering::Relaxed)
    }

    pub fn runs_completed(&self) -> u64 {
        self.inner.runs_completed.load(Ordering::Relaxed)
    }

    pub fn runs_failed(&self) -> u64 {
        self.inner.runs_failed.load(Ordering::Relaxed)
    }

    pub fn blocks_cleaned(&self) -> u64 {
        self.inner.blocks_cleaned.load(Ordering::Relaxed)
    }

    pub fn blocks_failed(&self) -> u64 {
        self.inner.blocks_failed.load(Ordering::Relaxed)
    }

    pub fn last_successful_run_unix(&self) -> u64 {
        self.inner.last_successful_run_unix.load(Ordering::Relaxed)
    }
}
