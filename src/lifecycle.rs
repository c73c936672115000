use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::locks::RecordLocks;
use crate::messenger::Messenger;
use crate::models::{Post, PostDestination};
use crate::store;
use crate::timers::Timers;

/// Drives each (post, destination) pair through
/// publish -> (pin) -> unpin -> delete.
///
/// Every mutating action takes the post's record lock, re-reads state, and
/// bails out when the work is already done — so the periodic tick, one-shot
/// timers, and the startup reconciliation can all call the same primitives
/// without coordinating beyond the lock.
pub struct Lifecycle<M> {
    pool: SqlitePool,
    messenger: Arc<M>,
    timers: Arc<Timers>,
    locks: Arc<RecordLocks>,
    tz: Tz,
    /// Operator destination for reminders; None disables them.
    notify_chat: Option<i64>,
    /// Destination whose traffic feeds idle detection.
    primary_chat: Option<i64>,
    reminder_lead: Duration,
    send_delay: std::time::Duration,
}

impl<M> Clone for Lifecycle<M> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            messenger: Arc::clone(&self.messenger),
            timers: Arc::clone(&self.timers),
            locks: Arc::clone(&self.locks),
            tz: self.tz,
            notify_chat: self.notify_chat,
            primary_chat: self.primary_chat,
            reminder_lead: self.reminder_lead,
            send_delay: self.send_delay,
        }
    }
}

impl<M: Messenger + 'static> Lifecycle<M> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        messenger: Arc<M>,
        timers: Arc<Timers>,
        locks: Arc<RecordLocks>,
        tz: Tz,
        notify_chat: Option<i64>,
        primary_chat: Option<i64>,
        reminder_lead: Duration,
        send_delay: std::time::Duration,
    ) -> Self {
        Self {
            pool,
            messenger,
            timers,
            locks,
            tz,
            notify_chat,
            primary_chat,
            reminder_lead,
            send_delay,
        }
    }

    // ── Publication ────────────────────────────────────────────────────

    /// Publish every due post to every destination that hasn't received it
    /// yet. One failing post never blocks the rest.
    pub async fn publish_due(&self, now: DateTime<Utc>) -> Result<()> {
        let posts = store::get_due_posts(&self.pool, now).await?;
        for post in posts {
            if let Err(e) = self.publish_post(&post, now).await {
                error!(post = %post.id, error = format!("{e:#}"), "publishing post failed");
            }
        }
        Ok(())
    }

    async fn publish_post(&self, post: &Post, now: DateTime<Utc>) -> Result<()> {
        let _guard = self.locks.acquire(&post.id).await;

        let payload = post.payload().context("decoding post content")?;
        let destinations = store::get_destinations(&self.pool, &post.id).await?;

        for dest in destinations.iter().filter(|d| !d.published) {
            match self.messenger.send(dest.chat_id, &payload).await {
                Ok(message_ids) => {
                    store::mark_published(&self.pool, &post.id, dest.chat_id, &message_ids).await?;
                    if self.primary_chat == Some(dest.chat_id) {
                        store::touch_last_activity(&self.pool, now).await?;
                    }
                    info!(post = %post.id, chat = dest.chat_id, messages = message_ids.len(), "published post");

                    if let Some(published) = store::get_destination(&self.pool, &post.id, dest.chat_id).await? {
                        self.pin_if_due(&published, now).await;
                        self.arm_followups(&published, now);
                    }
                }
                Err(e) => {
                    // Left unpublished; the next tick retries (at-least-once)
                    warn!(post = %post.id, chat = dest.chat_id, error = format!("{e:#}"), "send failed, will retry");
                }
            }
            tokio::time::sleep(self.send_delay).await;
        }
        Ok(())
    }

    // ── Follow-up scheduling ───────────────────────────────────────────

    /// Re-check pins and re-arm follow-up timers for every published
    /// destination with a pending deadline. Runs on every tick; timer ids are
    /// deterministic, so re-arming replaces instead of duplicating.
    pub async fn refresh_followups(&self, now: DateTime<Utc>) -> Result<()> {
        let pending = store::get_pending_followups(&self.pool).await?;
        for dest in &pending {
            self.pin_if_due(dest, now).await;
            self.arm_followups(dest, now);
        }
        Ok(())
    }

    /// Arm one-shot unpin/delete timers (plus their lead-time reminders) for
    /// a published destination. Deadlines already in the past are left to the
    /// startup reconciliation or the caller.
    pub fn arm_followups(&self, dest: &PostDestination, now: DateTime<Utc>) {
        if !dest.published {
            return;
        }

        if let Some(unpin_at) = dest.unpin_at
            && unpin_at > now
        {
            let remind_at = (unpin_at - self.reminder_lead).max(now);
            let this = self.clone();
            let (post_id, chat_id) = (dest.post_id.clone(), dest.chat_id);
            self.timers.arm(
                &format!("remind-unpin-{}-{}", dest.post_id, dest.chat_id),
                remind_at,
                async move {
                    this.remind(&post_id, chat_id, "unpinned", unpin_at).await;
                },
            );

            let this = self.clone();
            let (post_id, chat_id) = (dest.post_id.clone(), dest.chat_id);
            self.timers.arm(
                &format!("unpin-{}-{}", dest.post_id, dest.chat_id),
                unpin_at,
                async move {
                    if let Err(e) = this.unpin(&post_id, chat_id).await {
                        error!(post = %post_id, chat = chat_id, error = format!("{e:#}"), "scheduled unpin failed");
                    }
                },
            );
        }

        if let Some(delete_at) = dest.delete_at
            && delete_at > now
        {
            let remind_at = (delete_at - self.reminder_lead).max(now);
            let this = self.clone();
            let (post_id, chat_id) = (dest.post_id.clone(), dest.chat_id);
            self.timers.arm(
                &format!("remind-delete-{}-{}", dest.post_id, dest.chat_id),
                remind_at,
                async move {
                    this.remind(&post_id, chat_id, "deleted", delete_at).await;
                },
            );

            let this = self.clone();
            let post_id = dest.post_id.clone();
            self.timers.arm(
                &format!("delete-{}-{}", dest.post_id, dest.chat_id),
                delete_at,
                async move {
                    if let Err(e) = this.delete(&post_id).await {
                        error!(post = %post_id, error = format!("{e:#}"), "scheduled delete failed");
                    }
                },
            );
        }
    }

    // ── Pin / unpin ────────────────────────────────────────────────────

    /// Pin the destination's first message if it should be pinned and isn't.
    /// A pin is never attempted once the unpin deadline has passed — a
    /// delayed pin firing after the deadline would stick forever.
    pub async fn pin_if_due(&self, dest: &PostDestination, now: DateTime<Utc>) {
        let Some(unpin_at) = dest.unpin_at else { return };
        if !dest.published || now >= unpin_at {
            return;
        }
        let Some(first) = dest.first_message_id() else { return };

        match store::get_pin_state(&self.pool, dest.chat_id, first).await {
            Ok(true) => {} // already pinned
            Ok(false) => {
                if let Err(e) = self.messenger.pin(dest.chat_id, first).await {
                    warn!(post = %dest.post_id, chat = dest.chat_id, error = format!("{e:#}"), "pin failed, will retry");
                    return;
                }
                if let Err(e) = store::set_pin_state(&self.pool, dest.chat_id, first, true).await {
                    error!(chat = dest.chat_id, message = first, error = format!("{e:#}"), "failed to record pin");
                    return;
                }
                info!(post = %dest.post_id, chat = dest.chat_id, message = first, "pinned message");
            }
            Err(e) => {
                error!(chat = dest.chat_id, error = format!("{e:#}"), "failed to read pin state");
            }
        }
    }

    /// Unpin the destination's first message. Safe to call repeatedly: only
    /// an observed pinned state triggers an external call.
    pub async fn unpin(&self, post_id: &str, chat_id: i64) -> Result<()> {
        let _guard = self.locks.acquire(post_id).await;

        // Missing entity: deleted concurrently, nothing to do
        let Some(dest) = store::get_destination(&self.pool, post_id, chat_id).await? else {
            return Ok(());
        };
        if !dest.published {
            return Ok(());
        }
        let Some(first) = dest.first_message_id() else {
            return Ok(());
        };

        if store::get_pin_state(&self.pool, chat_id, first).await? {
            self.messenger
                .unpin(chat_id, first)
                .await
                .with_context(|| format!("unpinning message {first} in chat {chat_id}"))?;
            store::set_pin_state(&self.pool, chat_id, first, false).await?;
            info!(post = %post_id, chat = chat_id, message = first, "unpinned message");
            self.notify_operator(&format!("post {post_id}: unpinned in chat {chat_id}"))
                .await;
        } else {
            debug!(post = %post_id, chat = chat_id, "unpin already done");
        }
        Ok(())
    }

    // ── Deletion ───────────────────────────────────────────────────────

    /// Delete every recorded message of the post in every destination, then
    /// remove the post itself. External deletions are best-effort; the store
    /// deletion proceeds once all destinations were attempted.
    pub async fn delete(&self, post_id: &str) -> Result<()> {
        let _guard = self.locks.acquire(post_id).await;

        let Some(post) = store::get_post(&self.pool, post_id).await? else {
            return Ok(()); // already gone
        };
        let destinations = store::get_destinations(&self.pool, post_id).await?;

        for dest in &destinations {
            let message_ids = dest.message_ids();
            if message_ids.is_empty() {
                continue;
            }
            match self.messenger.delete_messages(dest.chat_id, &message_ids).await {
                Ok(()) => {
                    if let Err(e) = store::clear_pin_states(&self.pool, dest.chat_id, &message_ids).await {
                        warn!(chat = dest.chat_id, error = format!("{e:#}"), "failed to clear pin records");
                    }
                    info!(post = %post_id, chat = dest.chat_id, messages = message_ids.len(), "deleted messages");
                }
                Err(e) => {
                    warn!(post = %post_id, chat = dest.chat_id, error = format!("{e:#}"), "message deletion failed");
                }
            }
        }

        store::delete_post(&self.pool, post_id).await?;

        // Sibling timers for this post are now pointless
        for dest in &destinations {
            for action in ["remind-unpin", "unpin", "remind-delete", "delete"] {
                self.timers.cancel(&format!("{action}-{post_id}-{}", dest.chat_id));
            }
        }

        info!(post = %post.id, "post removed");
        self.notify_operator(&format!("post {post_id}: deleted from all chats and from the database"))
            .await;
        Ok(())
    }

    // ── Operator notifications ─────────────────────────────────────────

    /// Lead-time reminder. Never mutates state; re-sending is harmless.
    async fn remind(&self, post_id: &str, chat_id: i64, action: &str, deadline: DateTime<Utc>) {
        let now = Utc::now();
        if store::get_destination(&self.pool, post_id, chat_id)
            .await
            .ok()
            .flatten()
            .is_none()
        {
            return; // post vanished in the meantime
        }

        // Whole minutes are enough precision for an operator message
        let remaining_secs = (deadline - now).num_seconds().max(0) as u64;
        let remaining = humantime::format_duration(std::time::Duration::from_secs(remaining_secs / 60 * 60));
        let local = deadline.with_timezone(&self.tz);
        self.notify_operator(&format!(
            "post {post_id}: will be {action} in chat {chat_id} at {} (in {remaining})",
            local.format("%Y-%m-%d %H:%M %Z")
        ))
        .await;
    }

    async fn notify_operator(&self, text: &str) {
        let Some(chat) = self.notify_chat else { return };
        if let Err(e) = self.messenger.notify(chat, text).await {
            warn!(error = format!("{e:#}"), "operator notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::messenger::fake::{Call, RecordingMessenger};
    use crate::models::ContentPayload;
    use crate::store::DestinationSpec;
    use chrono::NaiveDateTime;
    use std::sync::atomic::Ordering;

    const CHAT_A: i64 = 11;
    const CHAT_B: i64 = 22;
    const OPERATOR: i64 = 99;

    fn at(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .expect("timestamp")
            .and_utc()
    }

    fn text(body: &str) -> ContentPayload {
        ContentPayload::Text { body: body.to_string() }
    }

    async fn lifecycle() -> (Lifecycle<RecordingMessenger>, SqlitePool, Arc<RecordingMessenger>) {
        let pool = create_test_pool().await.expect("pool");
        let messenger = Arc::new(RecordingMessenger::new());
        let lifecycle = Lifecycle::new(
            pool.clone(),
            Arc::clone(&messenger),
            Timers::new(),
            RecordLocks::new(),
            chrono_tz::UTC,
            Some(OPERATOR),
            Some(CHAT_A),
            Duration::days(3),
            std::time::Duration::ZERO,
        );
        (lifecycle, pool, messenger)
    }

    #[tokio::test]
    async fn publishes_to_both_destinations_and_unpins_only_one() {
        let (lifecycle, pool, messenger) = lifecycle().await;
        let t0 = at("2026-08-01 10:00:00");

        let post_id = store::create_post(
            &pool,
            &text("announcement"),
            t0,
            &[
                DestinationSpec {
                    chat_id: CHAT_A,
                    unpin_at: Some(t0 + Duration::hours(1)),
                    delete_at: None,
                },
                DestinationSpec {
                    chat_id: CHAT_B,
                    unpin_at: None,
                    delete_at: None,
                },
            ],
        )
        .await
        .expect("create post");

        lifecycle.publish_due(t0 + Duration::minutes(1)).await.expect("publish");

        for chat in [CHAT_A, CHAT_B] {
            let dest = store::get_destination(&pool, &post_id, chat)
                .await
                .expect("query")
                .expect("row");
            assert!(dest.published);
            assert!(!dest.message_ids().is_empty());
        }

        // Pinned only where an unpin deadline exists
        let pins: Vec<_> = messenger
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Pin { .. }))
            .collect();
        assert_eq!(pins.len(), 1);
        assert!(matches!(pins[0], Call::Pin { chat_id: CHAT_A, .. }));

        // Unpin fires for A, B is never touched
        lifecycle.unpin(&post_id, CHAT_A).await.expect("unpin");
        let unpins: Vec<_> = messenger
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Unpin { .. }))
            .collect();
        assert_eq!(unpins.len(), 1);
        assert!(matches!(unpins[0], Call::Unpin { chat_id: CHAT_A, .. }));
    }

    #[tokio::test]
    async fn unpin_twice_makes_one_external_call() {
        let (lifecycle, pool, messenger) = lifecycle().await;
        let t0 = at("2026-08-01 10:00:00");

        let post_id = store::create_post(
            &pool,
            &text("pinned news"),
            t0,
            &[DestinationSpec {
                chat_id: CHAT_A,
                unpin_at: Some(t0 + Duration::hours(1)),
                delete_at: None,
            }],
        )
        .await
        .expect("create post");

        lifecycle.publish_due(t0).await.expect("publish");
        lifecycle.unpin(&post_id, CHAT_A).await.expect("first unpin");
        lifecycle.unpin(&post_id, CHAT_A).await.expect("second unpin");

        let unpins = messenger
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Unpin { .. }))
            .count();
        assert_eq!(unpins, 1);
    }

    #[tokio::test]
    async fn no_pin_after_unpin_deadline_passed() {
        let (lifecycle, pool, messenger) = lifecycle().await;
        let t0 = at("2026-08-01 10:00:00");

        let post_id = store::create_post(
            &pool,
            &text("late"),
            t0,
            &[DestinationSpec {
                chat_id: CHAT_A,
                unpin_at: Some(t0 + Duration::hours(1)),
                delete_at: None,
            }],
        )
        .await
        .expect("create post");

        // Published only after the unpin deadline has already passed
        let late = t0 + Duration::hours(2);
        lifecycle.publish_due(late).await.expect("publish");

        assert!(store::get_destination(&pool, &post_id, CHAT_A)
            .await
            .expect("query")
            .expect("row")
            .published);
        assert!(!messenger.calls().iter().any(|c| matches!(c, Call::Pin { .. })));

        // The follow-up refresh must not pin either
        lifecycle.refresh_followups(late).await.expect("refresh");
        assert!(!messenger.calls().iter().any(|c| matches!(c, Call::Pin { .. })));
    }

    #[tokio::test]
    async fn delete_removes_messages_then_post_and_tolerates_repeat() {
        let (lifecycle, pool, messenger) = lifecycle().await;
        let t0 = at("2026-08-01 10:00:00");

        let post_id = store::create_post(
            &pool,
            &ContentPayload::Photo {
                media_refs: vec!["ref-1".into(), "ref-2".into()],
                caption: Some("album".into()),
            },
            t0,
            &[
                DestinationSpec {
                    chat_id: CHAT_A,
                    unpin_at: None,
                    delete_at: Some(t0 + Duration::days(1)),
                },
                DestinationSpec {
                    chat_id: CHAT_B,
                    unpin_at: None,
                    delete_at: Some(t0 + Duration::days(1)),
                },
            ],
        )
        .await
        .expect("create post");

        lifecycle.publish_due(t0).await.expect("publish");
        lifecycle.delete(&post_id).await.expect("delete");

        let deletes = messenger
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Delete { .. }))
            .count();
        assert_eq!(deletes, 2);
        assert!(store::get_post(&pool, &post_id).await.expect("query").is_none());

        // Second delete is a no-op, not an error
        lifecycle.delete(&post_id).await.expect("repeat delete");
        let deletes_after = messenger
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Delete { .. }))
            .count();
        assert_eq!(deletes_after, 2);
    }

    #[tokio::test]
    async fn failed_send_is_retried_on_next_tick() {
        let (lifecycle, pool, messenger) = lifecycle().await;
        let t0 = at("2026-08-01 10:00:00");

        let post_id = store::create_post(
            &pool,
            &text("flaky"),
            t0,
            &[DestinationSpec {
                chat_id: CHAT_B,
                unpin_at: None,
                delete_at: None,
            }],
        )
        .await
        .expect("create post");

        messenger.fail_sends.store(true, Ordering::SeqCst);
        lifecycle.publish_due(t0).await.expect("tick with failure");
        assert!(!store::get_destination(&pool, &post_id, CHAT_B)
            .await
            .expect("query")
            .expect("row")
            .published);

        messenger.fail_sends.store(false, Ordering::SeqCst);
        lifecycle.publish_due(t0 + Duration::minutes(1)).await.expect("retry tick");
        assert!(store::get_destination(&pool, &post_id, CHAT_B)
            .await
            .expect("query")
            .expect("row")
            .published);
        assert_eq!(messenger.sends(), 1);
    }

    #[tokio::test]
    async fn publish_touches_last_activity_for_primary_chat_only() {
        let (lifecycle, pool, _messenger) = lifecycle().await;
        let t0 = at("2026-08-01 10:00:00");

        store::create_post(
            &pool,
            &text("secondary only"),
            t0,
            &[DestinationSpec {
                chat_id: CHAT_B,
                unpin_at: None,
                delete_at: None,
            }],
        )
        .await
        .expect("create post");
        lifecycle.publish_due(t0).await.expect("publish");
        assert!(store::get_last_activity(&pool).await.expect("read").is_none());

        store::create_post(
            &pool,
            &text("primary"),
            t0,
            &[DestinationSpec {
                chat_id: CHAT_A,
                unpin_at: None,
                delete_at: None,
            }],
        )
        .await
        .expect("create post");
        lifecycle.publish_due(t0).await.expect("publish");
        assert!(store::get_last_activity(&pool).await.expect("read").is_some());
    }
}
