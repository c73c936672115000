use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{error, info};

use crate::lifecycle::Lifecycle;
use crate::messenger::Messenger;
use crate::store;

/// One pass over every published destination with a pending deadline, run at
/// startup before the periodic driver begins.
///
/// Armed timers die with the process; the persisted timestamps are the truth.
/// Anything that became due while the process was down is executed inline
/// through the same idempotent lifecycle primitives the timers use — an
/// action that already happened before a crash is a safe no-op — and
/// everything still in the future is re-armed.
pub async fn reconcile<M: Messenger + 'static>(
    lifecycle: &Lifecycle<M>,
    pool: &SqlitePool,
    now: DateTime<Utc>,
) -> Result<()> {
    let pending = store::get_pending_followups(pool).await?;
    let scanned = pending.len();
    let mut executed = 0usize;

    for dest in &pending {
        if let Some(delete_at) = dest.delete_at
            && delete_at <= now
        {
            match lifecycle.delete(&dest.post_id).await {
                Ok(()) => executed += 1,
                Err(e) => {
                    error!(post = %dest.post_id, error = format!("{e:#}"), "missed delete failed");
                }
            }
            // The post is gone (or will be retried next startup); nothing to arm
            continue;
        }

        if let Some(unpin_at) = dest.unpin_at
            && unpin_at <= now
        {
            match lifecycle.unpin(&dest.post_id, dest.chat_id).await {
                Ok(()) => executed += 1,
                Err(e) => {
                    error!(post = %dest.post_id, chat = dest.chat_id, error = format!("{e:#}"), "missed unpin failed");
                }
            }
        }

        // Past deadlines are skipped inside; future ones get their timers
        lifecycle.arm_followups(dest, now);
    }

    info!(scanned, executed, "startup reconciliation complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::locks::RecordLocks;
    use crate::messenger::fake::{Call, RecordingMessenger};
    use crate::models::ContentPayload;
    use crate::store::DestinationSpec;
    use crate::timers::Timers;
    use chrono::{Duration, NaiveDateTime};
    use std::sync::Arc;

    const CHAT: i64 = 33;

    fn at(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .expect("timestamp")
            .and_utc()
    }

    fn text(body: &str) -> ContentPayload {
        ContentPayload::Text { body: body.to_string() }
    }

    async fn setup() -> (
        Lifecycle<RecordingMessenger>,
        SqlitePool,
        Arc<RecordingMessenger>,
        Arc<Timers>,
    ) {
        let pool = create_test_pool().await.expect("pool");
        let messenger = Arc::new(RecordingMessenger::new());
        let timers = Timers::new();
        let lifecycle = Lifecycle::new(
            pool.clone(),
            Arc::clone(&messenger),
            Arc::clone(&timers),
            RecordLocks::new(),
            chrono_tz::UTC,
            None,
            None,
            Duration::days(3),
            std::time::Duration::ZERO,
        );
        (lifecycle, pool, messenger, timers)
    }

    fn unpin_calls(messenger: &RecordingMessenger) -> usize {
        messenger
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Unpin { .. }))
            .count()
    }

    #[tokio::test]
    async fn overdue_unpin_runs_once_with_no_duplicate_on_next_tick() {
        let (lifecycle, pool, messenger, _timers) = setup().await;
        let t0 = at("2026-08-01 10:00:00");

        let post_id = store::create_post(
            &pool,
            &text("pinned while offline"),
            t0,
            &[DestinationSpec {
                chat_id: CHAT,
                unpin_at: Some(t0 + Duration::hours(1)),
                delete_at: None,
            }],
        )
        .await
        .expect("create");
        lifecycle.publish_due(t0).await.expect("publish");
        assert_eq!(unpin_calls(&messenger), 0);

        // "Restart" two hours later: the unpin deadline passed while down
        let startup = t0 + Duration::hours(2);
        reconcile(&lifecycle, &pool, startup).await.expect("reconcile");
        assert_eq!(unpin_calls(&messenger), 1);

        // The first periodic tick after startup must not unpin again
        lifecycle.refresh_followups(startup).await.expect("tick");
        lifecycle.unpin(&post_id, CHAT).await.expect("explicit re-run");
        assert_eq!(unpin_calls(&messenger), 1);
    }

    #[tokio::test]
    async fn overdue_delete_removes_post_at_startup() {
        let (lifecycle, pool, messenger, _timers) = setup().await;
        let t0 = at("2026-08-01 10:00:00");

        let post_id = store::create_post(
            &pool,
            &text("short lived"),
            t0,
            &[DestinationSpec {
                chat_id: CHAT,
                unpin_at: None,
                delete_at: Some(t0 + Duration::hours(1)),
            }],
        )
        .await
        .expect("create");
        lifecycle.publish_due(t0).await.expect("publish");

        reconcile(&lifecycle, &pool, t0 + Duration::days(1))
            .await
            .expect("reconcile");

        assert!(store::get_post(&pool, &post_id).await.expect("query").is_none());
        assert_eq!(
            messenger
                .calls()
                .iter()
                .filter(|c| matches!(c, Call::Delete { .. }))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn future_deadlines_are_armed_not_executed() {
        let (lifecycle, pool, messenger, timers) = setup().await;
        let t0 = at("2026-08-01 10:00:00");

        store::create_post(
            &pool,
            &text("still fresh"),
            t0,
            &[DestinationSpec {
                chat_id: CHAT,
                unpin_at: Some(t0 + Duration::days(7)),
                delete_at: Some(t0 + Duration::days(14)),
            }],
        )
        .await
        .expect("create");
        lifecycle.publish_due(t0).await.expect("publish");

        let before = timers.armed_count();
        reconcile(&lifecycle, &pool, t0 + Duration::minutes(5))
            .await
            .expect("reconcile");

        assert!(timers.armed_count() >= before);
        assert_eq!(unpin_calls(&messenger), 0);
        assert!(!messenger.calls().iter().any(|c| matches!(c, Call::Delete { .. })));
    }
}
