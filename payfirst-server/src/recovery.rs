//! Startup recovery for records orphaned by a crash.
//!
//! A process that dies mid-sweep leaves its claimed records in `Processing`.
//! The claim query would pick them up anyway once they go stale; releasing
//! them at startup just makes them visible as `Pending` again in listings and
//! stats straight away. A manual completion interrupted the same way goes
//! back to `Failed`, where the operator left it.

use std::time::Duration;

use tracing::{error, info};

use crate::repository::{PendingWorkStore, StaleRecovery};

/// Release stale `Processing` records. Called once on startup, before the
/// sweep loop starts.
pub async fn release_orphaned_work(
    store: &dyn PendingWorkStore,
    stale_lock_timeout: Duration,
    max_attempts: u32,
) -> StaleRecovery {
    info!("Starting crash recovery for orphaned pending work...");

    match store.release_stale(stale_lock_timeout, max_attempts).await {
        Ok(recovery) if recovery.total() == 0 => {
            info!("No orphaned pending work found. Recovery complete.");
            recovery
        }
        Ok(recovery) => {
            info!(
                "Released {} orphaned record(s) back to pending and {} back to failed. Recovery complete.",
                recovery.requeued, recovery.refailed
            );
            recovery
        }
        Err(e) => {
            error!("Failed to release orphaned pending work: {}. Recovery aborted.", e);
            StaleRecovery::default()
        }
    }
}
