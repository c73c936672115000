use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::locks::RecordLocks;
use crate::messenger::Messenger;
use crate::models::{Broadcast, BroadcastMode, WindowConfig};
use crate::store;
use crate::window::{DailyWindow, effective_window, is_within_window, next_window_start};

/// Runs recurring broadcasts. One pass per periodic tick; each campaign
/// publishes at most once per pass, so a backlog accumulated while the
/// process was down or the window was closed is never replayed.
pub struct Broadcaster<M> {
    pool: SqlitePool,
    messenger: Arc<M>,
    locks: Arc<RecordLocks>,
    tz: Tz,
    send_delay: std::time::Duration,
}

impl<M: Messenger> Broadcaster<M> {
    pub fn new(
        pool: SqlitePool,
        messenger: Arc<M>,
        locks: Arc<RecordLocks>,
        tz: Tz,
        send_delay: std::time::Duration,
    ) -> Self {
        Self {
            pool,
            messenger,
            locks,
            tz,
            send_delay,
        }
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<()> {
        let global = store::get_window_config(&self.pool).await?;
        let broadcasts = store::get_active_broadcasts(&self.pool).await?;

        for broadcast in &broadcasts {
            if let Err(e) = self.run_one(broadcast, global.as_ref(), now).await {
                error!(broadcast = %broadcast.id, error = format!("{e:#}"), "broadcast tick failed");
            }
        }
        Ok(())
    }

    async fn run_one(&self, broadcast: &Broadcast, global: Option<&WindowConfig>, now: DateTime<Utc>) -> Result<()> {
        let _guard = self.locks.acquire(&broadcast.id).await;

        // Reload under the lock; the campaign may have been stopped or
        // removed since the scan
        let Some(b) = store::get_broadcast(&self.pool, &broadcast.id).await? else {
            return Ok(());
        };
        if !b.is_active {
            return Ok(());
        }

        if now > b.end_at {
            store::update_broadcast_run(&self.pool, &b.id, b.next_run_at, None, true).await?;
            info!(broadcast = %b.id, end = %b.end_at.to_rfc3339(), "broadcast past its end, deactivated");
            return Ok(());
        }

        let (mode, window) = effective_window(&b, global);

        if b.next_run_at > now {
            // Not due. A window edit since the last computation may have left
            // next_run_at outside the window — realign without publishing.
            let local_next = b.next_run_at.with_timezone(&self.tz);
            if !is_within_window(local_next, mode, window) {
                let realigned = self.align(b.next_run_at, mode, window);
                debug!(broadcast = %b.id, next = %realigned.to_rfc3339(), "realigned next run to window");
                self.store_next(&b, realigned, None).await?;
            }
            return Ok(());
        }

        // Due. Outside the window nothing is published and nothing is
        // backfilled — the run moves to the next window opening.
        let local_now = now.with_timezone(&self.tz);
        if !is_within_window(local_now, mode, window) {
            let next = self.align(now, mode, window);
            debug!(broadcast = %b.id, next = %next.to_rfc3339(), "due outside window, skipping to window start");
            self.store_next(&b, next, None).await?;
            return Ok(());
        }

        let payload = b.payload().context("decoding broadcast content")?;
        let interval = Duration::minutes(b.interval_minutes);

        match self.messenger.send(b.chat_id, &payload).await {
            Ok(message_ids) => {
                info!(broadcast = %b.id, chat = b.chat_id, messages = message_ids.len(), "broadcast published");
                let next = self.align(now + interval, mode, window);
                self.store_next(&b, next, Some(now)).await?;
            }
            Err(e) => {
                // Advance anyway so a broken endpoint doesn't turn every tick
                // into a retry
                warn!(broadcast = %b.id, chat = b.chat_id, error = format!("{e:#}"), "broadcast send failed");
                let next = self.align(now + interval, mode, window);
                self.store_next(&b, next, None).await?;
            }
        }
        tokio::time::sleep(self.send_delay).await;
        Ok(())
    }

    /// Shift an instant to the next window opening if it falls outside.
    fn align(&self, t: DateTime<Utc>, mode: BroadcastMode, window: Option<DailyWindow>) -> DateTime<Utc> {
        next_window_start(t.with_timezone(&self.tz), mode, window).with_timezone(&Utc)
    }

    /// Persist the next run, deactivating instead of storing a run that
    /// would land past the campaign's end.
    async fn store_next(&self, b: &Broadcast, next: DateTime<Utc>, last_run: Option<DateTime<Utc>>) -> Result<()> {
        if next > b.end_at {
            store::update_broadcast_run(&self.pool, &b.id, next, last_run, true).await?;
            info!(broadcast = %b.id, "no further runs before end, deactivated");
        } else {
            store::update_broadcast_run(&self.pool, &b.id, next, last_run, false).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::messenger::fake::RecordingMessenger;
    use crate::models::ContentPayload;
    use crate::store::BroadcastSpec;
    use chrono::NaiveDateTime;
    use std::sync::atomic::Ordering;

    const CHAT: i64 = 44;

    fn at(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .expect("timestamp")
            .and_utc()
    }

    fn text() -> ContentPayload {
        ContentPayload::Text {
            body: "recurring".to_string(),
        }
    }

    async fn broadcaster() -> (Broadcaster<RecordingMessenger>, SqlitePool, Arc<RecordingMessenger>) {
        let pool = create_test_pool().await.expect("pool");
        let messenger = Arc::new(RecordingMessenger::new());
        let broadcaster = Broadcaster::new(
            pool.clone(),
            Arc::clone(&messenger),
            RecordLocks::new(),
            chrono_tz::UTC,
            std::time::Duration::ZERO,
        );
        (broadcaster, pool, messenger)
    }

    fn limited_spec(next_run_at: DateTime<Utc>, end_at: DateTime<Utc>) -> BroadcastSpec {
        BroadcastSpec {
            chat_id: CHAT,
            interval_minutes: 60,
            next_run_at,
            end_at,
            mode: BroadcastMode::Limited,
            window_start_min: Some(9 * 60),
            window_end_min: Some(23 * 60),
        }
    }

    #[tokio::test]
    async fn long_outage_publishes_at_most_once() {
        let (broadcaster, pool, messenger) = broadcaster().await;
        // Due two days ago — dozens of missed occurrences
        let id = store::create_broadcast(
            &pool,
            &text(),
            &limited_spec(at("2026-07-30 10:00:00"), at("2026-09-01 00:00:00")),
        )
        .await
        .expect("create");

        let now = at("2026-08-01 12:00:00"); // inside window
        broadcaster.tick(now).await.expect("tick");

        assert_eq!(messenger.sends(), 1);
        let b = store::get_broadcast(&pool, &id).await.expect("query").expect("row");
        assert_eq!(b.next_run_at, at("2026-08-01 13:00:00"));
        assert_eq!(b.last_run_at, Some(now));
        assert!(b.is_active);

        // Same tick again: not due any more
        broadcaster.tick(now).await.expect("second tick");
        assert_eq!(messenger.sends(), 1);
    }

    #[tokio::test]
    async fn due_outside_window_skips_to_window_start() {
        let (broadcaster, pool, messenger) = broadcaster().await;
        let id = store::create_broadcast(
            &pool,
            &text(),
            &limited_spec(at("2026-07-31 22:00:00"), at("2026-09-01 00:00:00")),
        )
        .await
        .expect("create");

        let now = at("2026-08-01 03:00:00"); // outside 09:00..23:00
        broadcaster.tick(now).await.expect("tick");

        assert_eq!(messenger.sends(), 0);
        let b = store::get_broadcast(&pool, &id).await.expect("query").expect("row");
        assert_eq!(b.next_run_at, at("2026-08-01 09:00:00"));
        assert_eq!(b.last_run_at, None);
    }

    #[tokio::test]
    async fn expired_campaign_deactivates_without_publishing() {
        let (broadcaster, pool, messenger) = broadcaster().await;
        let id = store::create_broadcast(
            &pool,
            &text(),
            &limited_spec(at("2026-07-01 10:00:00"), at("2026-07-02 10:00:00")),
        )
        .await
        .expect("create");

        broadcaster.tick(at("2026-08-01 12:00:00")).await.expect("tick");

        assert_eq!(messenger.sends(), 0);
        let b = store::get_broadcast(&pool, &id).await.expect("query").expect("row");
        assert!(!b.is_active);
    }

    #[tokio::test]
    async fn failed_send_advances_one_interval() {
        let (broadcaster, pool, messenger) = broadcaster().await;
        let id = store::create_broadcast(
            &pool,
            &text(),
            &limited_spec(at("2026-08-01 11:30:00"), at("2026-09-01 00:00:00")),
        )
        .await
        .expect("create");

        messenger.fail_sends.store(true, Ordering::SeqCst);
        let now = at("2026-08-01 12:00:00");
        broadcaster.tick(now).await.expect("tick");

        let b = store::get_broadcast(&pool, &id).await.expect("query").expect("row");
        assert_eq!(b.next_run_at, at("2026-08-01 13:00:00"));
        assert_eq!(b.last_run_at, None, "failed run must not count as a run");
        assert!(b.is_active);
    }

    #[tokio::test]
    async fn future_run_outside_edited_window_is_realigned() {
        let (broadcaster, pool, messenger) = broadcaster().await;
        // next_run_at computed before the window existed: 05:00 tomorrow
        let id = store::create_broadcast(
            &pool,
            &text(),
            &limited_spec(at("2026-08-02 05:00:00"), at("2026-09-01 00:00:00")),
        )
        .await
        .expect("create");

        broadcaster.tick(at("2026-08-01 12:00:00")).await.expect("tick");

        assert_eq!(messenger.sends(), 0);
        let b = store::get_broadcast(&pool, &id).await.expect("query").expect("row");
        assert_eq!(b.next_run_at, at("2026-08-02 09:00:00"));
    }

    #[tokio::test]
    async fn deactivates_instead_of_storing_run_past_end() {
        let (broadcaster, pool, messenger) = broadcaster().await;
        let id = store::create_broadcast(
            &pool,
            &text(),
            &limited_spec(at("2026-08-01 12:00:00"), at("2026-08-01 12:30:00")),
        )
        .await
        .expect("create");

        let now = at("2026-08-01 12:00:00");
        broadcaster.tick(now).await.expect("tick");

        assert_eq!(messenger.sends(), 1, "final run still publishes");
        let b = store::get_broadcast(&pool, &id).await.expect("query").expect("row");
        assert!(!b.is_active);
        assert_eq!(b.last_run_at, Some(now));
    }

    #[tokio::test]
    async fn limited_without_any_window_behaves_as_full() {
        let (broadcaster, pool, messenger) = broadcaster().await;
        let spec = BroadcastSpec {
            window_start_min: None,
            window_end_min: None,
            ..limited_spec(at("2026-08-01 02:00:00"), at("2026-09-01 00:00:00"))
        };
        store::create_broadcast(&pool, &text(), &spec).await.expect("create");
        // No global fallback row enabled either

        broadcaster.tick(at("2026-08-01 03:00:00")).await.expect("tick");
        assert_eq!(messenger.sends(), 1, "no effective window means no constraint");
    }

    #[tokio::test]
    async fn global_fallback_window_applies_when_enabled() {
        let (broadcaster, pool, messenger) = broadcaster().await;
        store::upsert_window_config(&pool, true, 9 * 60, 23 * 60)
            .await
            .expect("seed window");
        let spec = BroadcastSpec {
            window_start_min: None,
            window_end_min: None,
            ..limited_spec(at("2026-08-01 02:00:00"), at("2026-09-01 00:00:00"))
        };
        let id = store::create_broadcast(&pool, &text(), &spec).await.expect("create");

        broadcaster.tick(at("2026-08-01 03:00:00")).await.expect("tick");

        assert_eq!(messenger.sends(), 0);
        let b = store::get_broadcast(&pool, &id).await.expect("query").expect("row");
        assert_eq!(b.next_run_at, at("2026-08-01 09:00:00"));
    }
}
