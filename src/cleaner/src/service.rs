//! Cleaner service lifecycle.
//!
//! Two-phase lifecycle: one synchronous cleanup at startup, then a recurring
//! timer. The next tick is only awaited after the previous run returns, so
//! runs never overlap. Cancellation ends the loop and is reported by the
//! in-flight run as a benign outcome, distinct from failure.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::metrics::CleanerMetrics;
use crate::sweep::{BlocksCleaner, SweepError};

pub struct CleanerService {
    cleaner: BlocksCleaner,
    interval: Duration,
}

impl CleanerService {
    pub fn new(cleaner: BlocksCleaner, interval: Duration) -> Self {
        Self { cleaner, interval }
    }

    pub fn metrics(&self) -> &CleanerMetrics {
        self.cleaner.metrics()
    }

    /// Run the service until `token` is canceled.
    pub async fn run(&self, token: CancellationToken) {
        // Startup run: anything depending on the cleaner can rely on one
        // full pass having happened before the interval schedule begins.
        self.run_cleanup(&token).await;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the startup run already
        // covered it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Cleaner service shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.run_cleanup(&token).await;
                }
            }
        }
    }

    /// Run one cleanup and record its outcome.
    pub async fn run_cleanup(&self, token: &CancellationToken) {
        info!("Starting cleanup of blocks and tenants marked for deletion");
        self.metrics().record_run_started();

        match self.cleaner.run(token).await {
            Ok(()) => {
                info!("Cleanup run completed");
                self.metrics().record_run_completed();
            }
            // External shutdown, not a deletion defect: neither the
            // completed nor the failed counter moves.
            Err(SweepError::Canceled) => {
                info!("Cleanup run canceled");
            }
            Err(e) => {
                error!(error = %e, "Cleanup run failed");
                self.metrics().record_run_failed();
            }
        }
    }
}
