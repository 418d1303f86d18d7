//! Background maintenance tasks.
//!
//! Includes:
//! - Compacting expired state tokens.
//! - Refreshing the fast-forward target.

use std::sync::Arc;

use factlog_store::{FactLog, FactStore};
use factlog_subscribe::FastForwardTarget;
use tokio::time::{sleep, Duration};

/// Starts the state token compaction task.
///
/// Runs indefinitely, deleting tokens older than `retention` every
/// `interval_seconds`.
pub async fn start_token_compaction_task(
    store: Arc<FactStore>,
    retention: chrono::Duration,
    interval_seconds: u64,
) {
    if interval_seconds == 0 {
        tracing::warn!("state token compaction disabled (interval=0)");
        return;
    }
    let interval = Duration::from_secs(interval_seconds);
    tracing::info!(
        interval_seconds,
        retention_days = retention.num_days(),
        "starting state token compaction task"
    );

    loop {
        sleep(interval).await;

        let store = Arc::clone(&store);
        let result = tokio::task::spawn_blocking(move || store.compact_state_tokens(retention)).await;

        match result {
            Ok(Ok(count)) => {
                if count > 0 {
                    tracing::info!(count, "compacted expired state tokens");
                } else {
                    tracing::debug!("no expired state tokens to compact");
                }
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "failed to compact state tokens");
            }
            Err(e) => {
                tracing::error!(error = %e, "compaction task panicked or was cancelled");
            }
        }
    }
}

/// Starts the fast-forward refresh task.
///
/// Re-reads the newest fact every `interval_seconds` so subscriptions can
/// be told how far the log has moved without each of them querying it.
pub async fn start_fast_forward_refresh_task(
    log: Arc<dyn FactLog>,
    target: Arc<FastForwardTarget>,
    interval_seconds: u64,
) {
    if interval_seconds == 0 {
        tracing::warn!("fast-forward refresh disabled (interval=0)");
        return;
    }
    let interval = Duration::from_secs(interval_seconds);
    tracing::info!(interval_seconds, "starting fast-forward refresh task");

    loop {
        let log = Arc::clone(&log);
        let target_ref = Arc::clone(&target);
        let result = tokio::task::spawn_blocking(move || target_ref.refresh(log.as_ref())).await;

        match result {
            Ok(Ok(latest)) => {
                tracing::debug!(serial = ?latest.map(|h| h.serial), "fast-forward target refreshed");
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "failed to refresh fast-forward target");
            }
            Err(e) => {
                tracing::error!(error = %e, "fast-forward refresh panicked or was cancelled");
            }
        }

        sleep(interval).await;
    }
}
