use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::error::ScheduleInputError;

/// What a post or broadcast actually sends. Closed set — every consumer
/// matches exhaustively instead of probing for attribute presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPayload {
    Text {
        body: String,
    },
    /// One or more photos. A single ref sends a plain photo, several send an
    /// album with the caption attached to the first element.
    Photo {
        media_refs: Vec<String>,
        caption: Option<String>,
    },
}

impl ContentPayload {
    /// Reassemble a payload from its storage columns.
    pub fn from_columns(
        content_type: &str,
        body: Option<&str>,
        media_refs_json: &str,
    ) -> Result<Self, ScheduleInputError> {
        match content_type {
            "text" => {
                let body = body.unwrap_or_default();
                if body.is_empty() {
                    return Err(ScheduleInputError::EmptyContent);
                }
                Ok(ContentPayload::Text { body: body.to_string() })
            }
            "photo" => {
                let media_refs: Vec<String> = serde_json::from_str(media_refs_json)
                    .map_err(|_| ScheduleInputError::EmptyContent)?;
                if media_refs.is_empty() {
                    return Err(ScheduleInputError::EmptyContent);
                }
                Ok(ContentPayload::Photo {
                    media_refs,
                    caption: body.filter(|b| !b.is_empty()).map(str::to_string),
                })
            }
            other => Err(ScheduleInputError::UnsupportedContentType(other.to_string())),
        }
    }

    /// Split a payload into its storage columns: (content_type, body, media_refs JSON).
    pub fn to_columns(&self) -> (&'static str, Option<String>, String) {
        match self {
            ContentPayload::Text { body } => ("text", Some(body.clone()), "[]".to_string()),
            ContentPayload::Photo { media_refs, caption } => (
                "photo",
                caption.clone(),
                serde_json::to_string(media_refs).unwrap_or_else(|_| "[]".to_string()),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastMode {
    Full,
    Limited,
}

impl BroadcastMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BroadcastMode::Full => "full",
            BroadcastMode::Limited => "limited",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(BroadcastMode::Full),
            "limited" => Some(BroadcastMode::Limited),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Post {
    pub id: String,
    pub content_type: String,
    pub body: Option<String>,
    pub media_refs: String,
    pub scheduled_at: DateTime<Utc>,
}

impl Post {
    pub fn payload(&self) -> Result<ContentPayload, ScheduleInputError> {
        ContentPayload::from_columns(&self.content_type, self.body.as_deref(), &self.media_refs)
    }
}

/// Per-destination lifecycle state of a post. `message_ids` is non-empty only
/// once `published` is set; `unpin_at`/`delete_at` are acted on only after
/// publication.
#[derive(Debug, Clone, FromRow)]
pub struct PostDestination {
    pub post_id: String,
    pub chat_id: i64,
    pub published: bool,
    pub message_ids: String,
    pub unpin_at: Option<DateTime<Utc>>,
    pub delete_at: Option<DateTime<Utc>>,
}

impl PostDestination {
    pub fn message_ids(&self) -> Vec<i64> {
        serde_json::from_str(&self.message_ids).unwrap_or_default()
    }

    pub fn first_message_id(&self) -> Option<i64> {
        self.message_ids().first().copied()
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Broadcast {
    pub id: String,
    pub content_type: String,
    pub body: Option<String>,
    pub media_refs: String,
    pub chat_id: i64,
    pub interval_minutes: i64,
    pub next_run_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub is_active: bool,
    pub mode: String,
    pub window_start_min: Option<i64>,
    pub window_end_min: Option<i64>,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Broadcast {
    pub fn payload(&self) -> Result<ContentPayload, ScheduleInputError> {
        ContentPayload::from_columns(&self.content_type, self.body.as_deref(), &self.media_refs)
    }

    pub fn mode(&self) -> BroadcastMode {
        BroadcastMode::parse(&self.mode).unwrap_or(BroadcastMode::Full)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PendingPost {
    pub id: String,
    pub content_type: String,
    pub body: Option<String>,
    pub media_refs: String,
    pub chat_id: i64,
}

impl PendingPost {
    pub fn payload(&self) -> Result<ContentPayload, ScheduleInputError> {
        ContentPayload::from_columns(&self.content_type, self.body.as_deref(), &self.media_refs)
    }
}

/// Global fallback window row (single row, id = 1).
#[derive(Debug, Clone, Copy, FromRow)]
pub struct WindowConfig {
    pub enabled: bool,
    pub start_min: i64,
    pub end_min: i64,
}
