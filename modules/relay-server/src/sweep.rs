//! Background retention sweep over settled command rows.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use relay_store::CommandStore;

/// Periodically delete terminal command rows older than `retention`.
/// Pending rows are never touched; their keys must stay claimable.
pub fn spawn_retention_sweep(
    store: CommandStore,
    retention: Duration,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match store.purge_terminal_older_than(retention).await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "Retention sweep removed settled commands"),
                Err(e) => warn!(error = %e, "Retention sweep failed"),
            }
        }
    })
}
