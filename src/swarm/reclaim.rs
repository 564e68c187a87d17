//! Lease reclaimer: expires abandoned tasks so their sources can be
//! claimed again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info};

use crate::error::DatabaseError;
use crate::store::Database;

/// How often the reclaimer sweeps.
pub const RECLAIM_INTERVAL: Duration = Duration::from_secs(60);

/// Expire every in-progress task older than `lease`. Returns the count.
pub async fn reclaim_expired(db: &dyn Database, lease: Duration) -> Result<usize, DatabaseError> {
    let lease = chrono::Duration::from_std(lease)
        .map_err(|e| DatabaseError::Query(format!("reclaim lease out of range: {e}")))?;
    db.expire_stale_tasks(Utc::now() - lease).await
}

/// Spawn a background task that reclaims expired leases every
/// [`RECLAIM_INTERVAL`].
pub fn spawn_reclaim_task(db: Arc<dyn Database>, lease: Duration) -> tokio::task::JoinHandle<()> {
    info!(lease_secs = lease.as_secs(), "Task lease reclaimer started");
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RECLAIM_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = reclaim_expired(db.as_ref(), lease).await {
                error!(error = %e, "Task reclaim sweep failed");
            }
        }
    })
}
