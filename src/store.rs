use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::error::ScheduleInputError;
use crate::models::{Broadcast, BroadcastMode, ContentPayload, PendingPost, Post, PostDestination, WindowConfig};

/// Storage timestamp format (UTC, second precision).
const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

fn ts(t: DateTime<Utc>) -> String {
    t.format(TS_FORMAT).to_string()
}

// ── Posts ──────────────────────────────────────────────────────────────

/// A destination a post should go to, with its optional lifecycle deadlines.
#[derive(Debug, Clone, Copy)]
pub struct DestinationSpec {
    pub chat_id: i64,
    pub unpin_at: Option<DateTime<Utc>>,
    pub delete_at: Option<DateTime<Utc>>,
}

/// Create a scheduled post. Malformed input is rejected here so it never
/// reaches the scheduler loops.
pub async fn create_post(
    pool: &SqlitePool,
    payload: &ContentPayload,
    scheduled_at: DateTime<Utc>,
    destinations: &[DestinationSpec],
) -> Result<String> {
    if destinations.is_empty() {
        return Err(ScheduleInputError::NoDestinations.into());
    }
    for dest in destinations {
        for deadline in [dest.unpin_at, dest.delete_at].into_iter().flatten() {
            if deadline <= scheduled_at {
                return Err(ScheduleInputError::EndBeforeStart {
                    start: ts(scheduled_at),
                    end: ts(deadline),
                }
                .into());
            }
        }
    }

    let (content_type, body, media_refs) = payload.to_columns();
    // Round-trips the payload to reject empty variants
    ContentPayload::from_columns(content_type, body.as_deref(), &media_refs)?;

    let id = Uuid::new_v4().to_string();
    let mut tx = pool.begin().await.context("beginning post insert")?;

    sqlx::query("INSERT INTO posts (id, content_type, body, media_refs, scheduled_at) VALUES (?, ?, ?, ?, ?)")
        .bind(&id)
        .bind(content_type)
        .bind(&body)
        .bind(&media_refs)
        .bind(ts(scheduled_at))
        .execute(&mut *tx)
        .await
        .context("inserting post")?;

    for dest in destinations {
        sqlx::query("INSERT INTO post_destinations (post_id, chat_id, unpin_at, delete_at) VALUES (?, ?, ?, ?)")
            .bind(&id)
            .bind(dest.chat_id)
            .bind(dest.unpin_at.map(ts))
            .bind(dest.delete_at.map(ts))
            .execute(&mut *tx)
            .await
            .context("inserting post destination")?;
    }

    tx.commit().await.context("committing post insert")?;
    debug!(post = %id, destinations = destinations.len(), "created scheduled post");
    Ok(id)
}

pub async fn get_post(pool: &SqlitePool, id: &str) -> Result<Option<Post>> {
    let post = sqlx::query_as::<_, Post>(
        "SELECT id, content_type, body, media_refs, scheduled_at FROM posts WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("querying post")?;
    Ok(post)
}

/// Posts whose scheduled time has passed and which still have at least one
/// unpublished destination.
pub async fn get_due_posts(pool: &SqlitePool, now: DateTime<Utc>) -> Result<Vec<Post>> {
    let posts = sqlx::query_as::<_, Post>(
        "SELECT DISTINCT p.id, p.content_type, p.body, p.media_refs, p.scheduled_at
         FROM posts p
         JOIN post_destinations d ON d.post_id = p.id
         WHERE p.scheduled_at <= ? AND d.published = 0
         ORDER BY p.scheduled_at ASC",
    )
    .bind(ts(now))
    .fetch_all(pool)
    .await
    .context("querying due posts")?;
    Ok(posts)
}

pub async fn get_destinations(pool: &SqlitePool, post_id: &str) -> Result<Vec<PostDestination>> {
    let rows = sqlx::query_as::<_, PostDestination>(
        "SELECT post_id, chat_id, published, message_ids, unpin_at, delete_at
         FROM post_destinations WHERE post_id = ? ORDER BY chat_id",
    )
    .bind(post_id)
    .fetch_all(pool)
    .await
    .context("querying post destinations")?;
    Ok(rows)
}

pub async fn get_destination(pool: &SqlitePool, post_id: &str, chat_id: i64) -> Result<Option<PostDestination>> {
    let row = sqlx::query_as::<_, PostDestination>(
        "SELECT post_id, chat_id, published, message_ids, unpin_at, delete_at
         FROM post_destinations WHERE post_id = ? AND chat_id = ?",
    )
    .bind(post_id)
    .bind(chat_id)
    .fetch_optional(pool)
    .await
    .context("querying post destination")?;
    Ok(row)
}

/// Every published destination with a pending unpin or delete deadline.
/// Drives follow-up re-arming on ticks and the startup reconciliation pass.
pub async fn get_pending_followups(pool: &SqlitePool) -> Result<Vec<PostDestination>> {
    let rows = sqlx::query_as::<_, PostDestination>(
        "SELECT post_id, chat_id, published, message_ids, unpin_at, delete_at
         FROM post_destinations
         WHERE published = 1 AND (unpin_at IS NOT NULL OR delete_at IS NOT NULL)
         ORDER BY post_id, chat_id",
    )
    .fetch_all(pool)
    .await
    .context("querying pending followups")?;
    Ok(rows)
}

pub async fn mark_published(pool: &SqlitePool, post_id: &str, chat_id: i64, message_ids: &[i64]) -> Result<()> {
    let json = serde_json::to_string(message_ids).context("serializing message ids")?;
    sqlx::query("UPDATE post_destinations SET published = 1, message_ids = ? WHERE post_id = ? AND chat_id = ?")
        .bind(&json)
        .bind(post_id)
        .bind(chat_id)
        .execute(pool)
        .await
        .context("marking destination published")?;
    Ok(())
}

/// Delete a post row (destinations cascade). Returns false when the post was
/// already gone — a concurrent delete is a no-op, not an error.
pub async fn delete_post(pool: &SqlitePool, id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM posts WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .context("deleting post")?;
    Ok(result.rows_affected() > 0)
}

// ── Pins ───────────────────────────────────────────────────────────────

pub async fn get_pin_state(pool: &SqlitePool, chat_id: i64, message_id: i64) -> Result<bool> {
    let pinned: Option<bool> = sqlx::query_scalar("SELECT pinned FROM pins WHERE chat_id = ? AND message_id = ?")
        .bind(chat_id)
        .bind(message_id)
        .fetch_optional(pool)
        .await
        .context("querying pin state")?;
    Ok(pinned.unwrap_or(false))
}

pub async fn set_pin_state(pool: &SqlitePool, chat_id: i64, message_id: i64, pinned: bool) -> Result<()> {
    sqlx::query(
        "INSERT INTO pins (chat_id, message_id, pinned) VALUES (?, ?, ?)
         ON CONFLICT(chat_id, message_id) DO UPDATE SET pinned = excluded.pinned",
    )
    .bind(chat_id)
    .bind(message_id)
    .bind(pinned)
    .execute(pool)
    .await
    .context("upserting pin state")?;
    Ok(())
}

/// Drop pin records for messages that no longer exist.
pub async fn clear_pin_states(pool: &SqlitePool, chat_id: i64, message_ids: &[i64]) -> Result<()> {
    for message_id in message_ids {
        sqlx::query("DELETE FROM pins WHERE chat_id = ? AND message_id = ?")
            .bind(chat_id)
            .bind(message_id)
            .execute(pool)
            .await
            .context("deleting pin state")?;
    }
    Ok(())
}

// ── Broadcasts ─────────────────────────────────────────────────────────

pub struct BroadcastSpec {
    pub chat_id: i64,
    pub interval_minutes: i64,
    pub next_run_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub mode: BroadcastMode,
    pub window_start_min: Option<i64>,
    pub window_end_min: Option<i64>,
}

pub async fn create_broadcast(pool: &SqlitePool, payload: &ContentPayload, spec: &BroadcastSpec) -> Result<String> {
    if spec.interval_minutes <= 0 {
        return Err(ScheduleInputError::NonPositiveInterval(spec.interval_minutes).into());
    }
    if spec.end_at <= spec.next_run_at {
        return Err(ScheduleInputError::EndBeforeStart {
            start: ts(spec.next_run_at),
            end: ts(spec.end_at),
        }
        .into());
    }
    for minute in [spec.window_start_min, spec.window_end_min].into_iter().flatten() {
        if !(0..1440).contains(&minute) {
            return Err(ScheduleInputError::WindowMinuteOutOfRange(minute).into());
        }
    }

    let (content_type, body, media_refs) = payload.to_columns();
    ContentPayload::from_columns(content_type, body.as_deref(), &media_refs)?;

    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO broadcasts (id, content_type, body, media_refs, chat_id, interval_minutes,
         next_run_at, end_at, is_active, mode, window_start_min, window_end_min)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?)",
    )
    .bind(&id)
    .bind(content_type)
    .bind(&body)
    .bind(&media_refs)
    .bind(spec.chat_id)
    .bind(spec.interval_minutes)
    .bind(ts(spec.next_run_at))
    .bind(ts(spec.end_at))
    .bind(spec.mode.as_str())
    .bind(spec.window_start_min)
    .bind(spec.window_end_min)
    .execute(pool)
    .await
    .context("inserting broadcast")?;

    debug!(broadcast = %id, chat = spec.chat_id, "created broadcast");
    Ok(id)
}

const BROADCAST_COLUMNS: &str = "id, content_type, body, media_refs, chat_id, interval_minutes,
    next_run_at, end_at, is_active, mode, window_start_min, window_end_min, last_run_at";

pub async fn get_active_broadcasts(pool: &SqlitePool) -> Result<Vec<Broadcast>> {
    let query = format!("SELECT {BROADCAST_COLUMNS} FROM broadcasts WHERE is_active = 1 ORDER BY next_run_at");
    let rows = sqlx::query_as::<_, Broadcast>(&query)
        .fetch_all(pool)
        .await
        .context("querying active broadcasts")?;
    Ok(rows)
}

pub async fn get_broadcast(pool: &SqlitePool, id: &str) -> Result<Option<Broadcast>> {
    let query = format!("SELECT {BROADCAST_COLUMNS} FROM broadcasts WHERE id = ?");
    let row = sqlx::query_as::<_, Broadcast>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("querying broadcast")?;
    Ok(row)
}

/// Advance or deactivate a broadcast after a tick. `last_run_at` is only
/// touched on a successful publish.
pub async fn update_broadcast_run(
    pool: &SqlitePool,
    id: &str,
    next_run_at: DateTime<Utc>,
    last_run_at: Option<DateTime<Utc>>,
    deactivate: bool,
) -> Result<()> {
    let result = if deactivate {
        sqlx::query("UPDATE broadcasts SET is_active = 0, last_run_at = COALESCE(?, last_run_at) WHERE id = ?")
            .bind(last_run_at.map(ts))
            .bind(id)
            .execute(pool)
            .await
    } else {
        sqlx::query(
            "UPDATE broadcasts SET next_run_at = ?, last_run_at = COALESCE(?, last_run_at) WHERE id = ?",
        )
        .bind(ts(next_run_at))
        .bind(last_run_at.map(ts))
        .bind(id)
        .execute(pool)
        .await
    };
    result.context("updating broadcast run")?;
    Ok(())
}

// ── Global fallback window ─────────────────────────────────────────────

pub async fn get_window_config(pool: &SqlitePool) -> Result<Option<WindowConfig>> {
    let row = sqlx::query_as::<_, WindowConfig>("SELECT enabled, start_min, end_min FROM broadcast_window WHERE id = 1")
        .fetch_optional(pool)
        .await
        .context("querying broadcast window config")?;
    Ok(row)
}

pub async fn upsert_window_config(pool: &SqlitePool, enabled: bool, start_min: i64, end_min: i64) -> Result<()> {
    sqlx::query(
        "INSERT INTO broadcast_window (id, enabled, start_min, end_min) VALUES (1, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET enabled = excluded.enabled,
           start_min = excluded.start_min, end_min = excluded.end_min",
    )
    .bind(enabled)
    .bind(start_min)
    .bind(end_min)
    .execute(pool)
    .await
    .context("upserting broadcast window config")?;
    Ok(())
}

// ── Pending posts (idle filler queue) ──────────────────────────────────

pub async fn create_pending_post(pool: &SqlitePool, payload: &ContentPayload, chat_id: i64) -> Result<String> {
    let (content_type, body, media_refs) = payload.to_columns();
    ContentPayload::from_columns(content_type, body.as_deref(), &media_refs)?;

    let id = Uuid::new_v4().to_string();
    sqlx::query("INSERT INTO pending_posts (id, content_type, body, media_refs, chat_id) VALUES (?, ?, ?, ?, ?)")
        .bind(&id)
        .bind(content_type)
        .bind(&body)
        .bind(&media_refs)
        .bind(chat_id)
        .execute(pool)
        .await
        .context("inserting pending post")?;
    Ok(id)
}

pub async fn get_pending_posts(pool: &SqlitePool) -> Result<Vec<PendingPost>> {
    let rows = sqlx::query_as::<_, PendingPost>(
        "SELECT id, content_type, body, media_refs, chat_id FROM pending_posts ORDER BY created_at",
    )
    .fetch_all(pool)
    .await
    .context("querying pending posts")?;
    Ok(rows)
}

pub async fn delete_pending_post(pool: &SqlitePool, id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM pending_posts WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .context("deleting pending post")?;
    Ok(result.rows_affected() > 0)
}

// ── Settings ───────────────────────────────────────────────────────────

pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("reading setting")?;
    Ok(row.map(|(v,)| v))
}

pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .context("upserting setting")?;
    Ok(())
}

const LAST_ACTIVITY_KEY: &str = "last_activity_at";

/// Record traffic on the primary chat, for idle detection.
pub async fn touch_last_activity(pool: &SqlitePool, at: DateTime<Utc>) -> Result<()> {
    set_setting(pool, LAST_ACTIVITY_KEY, &ts(at)).await
}

pub async fn get_last_activity(pool: &SqlitePool) -> Result<Option<DateTime<Utc>>> {
    let value = get_setting(pool, LAST_ACTIVITY_KEY).await?;
    Ok(value.and_then(|v| DateTime::parse_from_rfc3339(&v).ok().map(|t| t.with_timezone(&Utc))))
}
