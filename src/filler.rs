use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Timelike, Utc};
use rand::Rng;
use rand::seq::IndexedRandom;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::messenger::Messenger;
use crate::store;

/// Idle filler loop. Wakes every minute; when the primary chat has been quiet
/// for longer than the configured threshold during daytime hours, publishes
/// one randomly chosen pending post after a random delay.
pub async fn filler_loop<M: Messenger>(
    pool: SqlitePool,
    config: Arc<Config>,
    messenger: Arc<M>,
    cancel: CancellationToken,
) {
    info!("idle filler started");
    let tz = config.timezone();
    let threshold = config.idle_threshold();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("idle filler shutting down");
                return;
            }
            _ = tokio::time::sleep(std::time::Duration::from_secs(60)) => {}
        }

        let now = Utc::now();
        if !within_hours(now.with_timezone(&tz).hour(), config.idle.start_hour, config.idle.end_hour) {
            continue;
        }

        match is_idle(&pool, now, threshold).await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                error!(error = format!("{e:#}"), "failed to read last activity");
                continue;
            }
        }

        // Spread filler posts out instead of firing on the minute boundary
        let max_jitter = config.idle_max_jitter().as_secs().max(1);
        let delay = rand::rng().random_range(1..=max_jitter);
        debug!(delay_secs = delay, "chat is idle, delaying filler post");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(std::time::Duration::from_secs(delay)) => {}
        }

        // Re-check: something may have been posted while we waited
        let now = Utc::now();
        match is_idle(&pool, now, threshold).await {
            Ok(true) => {}
            _ => continue,
        }

        match publish_one_pending(&pool, messenger.as_ref(), now).await {
            Ok(true) => {}
            Ok(false) => debug!("no pending posts to fill with"),
            Err(e) => error!(error = format!("{e:#}"), "filler post failed"),
        }
    }
}

fn within_hours(hour: u32, start_hour: u32, end_hour: u32) -> bool {
    start_hour <= hour && hour < end_hour
}

async fn is_idle(pool: &SqlitePool, now: DateTime<Utc>, threshold: chrono::Duration) -> Result<bool> {
    let last = store::get_last_activity(pool).await?;
    Ok(last.is_none_or(|t| now - t > threshold))
}

/// Publish one randomly chosen pending post and drop it from the queue.
/// Returns false when the queue is empty.
pub async fn publish_one_pending<M: Messenger>(pool: &SqlitePool, messenger: &M, now: DateTime<Utc>) -> Result<bool> {
    let pending = store::get_pending_posts(pool).await?;
    let Some(post) = pending.choose(&mut rand::rng()) else {
        return Ok(false);
    };

    let payload = match post.payload() {
        Ok(p) => p,
        Err(e) => {
            // Malformed queue entry: drop it so it can't wedge the filler
            warn!(pending = %post.id, error = %e, "dropping malformed pending post");
            store::delete_pending_post(pool, &post.id).await?;
            return Ok(false);
        }
    };

    let message_ids = messenger.send(post.chat_id, &payload).await?;
    store::touch_last_activity(pool, now).await?;
    store::delete_pending_post(pool, &post.id).await?;
    info!(pending = %post.id, chat = post.chat_id, messages = message_ids.len(), "published filler post");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::messenger::fake::RecordingMessenger;
    use crate::models::ContentPayload;

    fn text(body: &str) -> ContentPayload {
        ContentPayload::Text { body: body.to_string() }
    }

    #[test]
    fn hour_gate() {
        assert!(within_hours(11, 11, 23));
        assert!(within_hours(22, 11, 23));
        assert!(!within_hours(23, 11, 23));
        assert!(!within_hours(3, 11, 23));
    }

    #[tokio::test]
    async fn idle_when_no_activity_recorded() {
        let pool = create_test_pool().await.expect("pool");
        let now = Utc::now();
        assert!(is_idle(&pool, now, chrono::Duration::hours(2)).await.expect("check"));

        store::touch_last_activity(&pool, now - chrono::Duration::minutes(30))
            .await
            .expect("touch");
        assert!(!is_idle(&pool, now, chrono::Duration::hours(2)).await.expect("check"));

        store::touch_last_activity(&pool, now - chrono::Duration::hours(3))
            .await
            .expect("touch");
        assert!(is_idle(&pool, now, chrono::Duration::hours(2)).await.expect("check"));
    }

    #[tokio::test]
    async fn publishes_and_consumes_one_pending_post() {
        let pool = create_test_pool().await.expect("pool");
        let messenger = RecordingMessenger::new();
        // Second precision: storage timestamps carry no sub-second part
        let now: DateTime<Utc> = "2026-08-01T12:00:00Z".parse().expect("timestamp");

        store::create_pending_post(&pool, &text("filler"), 55).await.expect("queue");

        assert!(publish_one_pending(&pool, &messenger, now).await.expect("fill"));
        assert_eq!(messenger.sends(), 1);
        assert!(store::get_pending_posts(&pool).await.expect("query").is_empty());
        assert_eq!(store::get_last_activity(&pool).await.expect("read"), Some(now));

        // Queue is now empty
        assert!(!publish_one_pending(&pool, &messenger, now).await.expect("fill"));
        assert_eq!(messenger.sends(), 1);
    }
}
