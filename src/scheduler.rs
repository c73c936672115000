use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::broadcast::Broadcaster;
use crate::lifecycle::Lifecycle;
use crate::messenger::Messenger;

/// Periodic driver. Each tick scans for due posts, refreshes pins and
/// follow-up timers, and runs one broadcast pass.
///
/// No error class is allowed to kill this loop: each phase logs its failure
/// and the next tick starts over from persisted state.
pub async fn scheduler_loop<M: Messenger + 'static>(
    lifecycle: Lifecycle<M>,
    broadcaster: Broadcaster<M>,
    tick_interval: std::time::Duration,
    cancel: CancellationToken,
) {
    info!(interval = ?tick_interval, "scheduler started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("scheduler shutting down");
                return;
            }
            _ = tokio::time::sleep(tick_interval) => {}
        }

        let now = Utc::now();

        if let Err(e) = lifecycle.publish_due(now).await {
            error!(error = format!("{e:#}"), "due-post scan failed");
        }

        if let Err(e) = lifecycle.refresh_followups(now).await {
            error!(error = format!("{e:#}"), "follow-up refresh failed");
        }

        if let Err(e) = broadcaster.tick(now).await {
            error!(error = format!("{e:#}"), "broadcast pass failed");
        }
    }
}
