use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

/// How long a group keeps accepting parts after its first one arrives.
/// Telegram delivers album parts as separate messages within a couple of
/// seconds of each other.
const FLUSH_AFTER_SECS: i64 = 2;

/// A fully collected media group, ready to be turned into a photo post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedAlbum {
    pub group_id: i64,
    pub media_refs: Vec<String>,
    pub caption: Option<String>,
}

#[derive(Debug)]
struct PendingAlbum {
    media_refs: Vec<String>,
    caption: Option<String>,
    flush_at: DateTime<Utc>,
}

/// Collects album parts by media-group id until the group's flush deadline.
///
/// Owned by whoever ingests incoming messages and drained from the periodic
/// driver; entries are removed on flush, so a group id can be reused later.
#[derive(Debug, Default)]
pub struct AlbumBuffer {
    pending: HashMap<i64, PendingAlbum>,
}

impl AlbumBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one part of a media group. The first non-empty caption wins
    /// (Telegram carries the album caption on a single part).
    pub fn push(&mut self, group_id: i64, media_ref: String, caption: Option<String>, now: DateTime<Utc>) {
        let entry = self.pending.entry(group_id).or_insert_with(|| PendingAlbum {
            media_refs: Vec::new(),
            caption: None,
            flush_at: now + Duration::seconds(FLUSH_AFTER_SECS),
        });
        entry.media_refs.push(media_ref);
        if entry.caption.is_none() {
            entry.caption = caption.filter(|c| !c.is_empty());
        }
    }

    /// Drain every group whose flush deadline has passed.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<CompletedAlbum> {
        let due: Vec<i64> = self
            .pending
            .iter()
            .filter(|(_, album)| album.flush_at <= now)
            .map(|(&id, _)| id)
            .collect();

        let mut completed: Vec<CompletedAlbum> = due
            .into_iter()
            .filter_map(|group_id| {
                self.pending.remove(&group_id).map(|album| CompletedAlbum {
                    group_id,
                    media_refs: album.media_refs,
                    caption: album.caption,
                })
            })
            .collect();
        completed.sort_by_key(|album| album.group_id);
        completed
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        "2026-08-01T10:00:00Z".parse().expect("timestamp")
    }

    #[test]
    fn collects_parts_until_deadline() {
        let mut buffer = AlbumBuffer::new();
        let t0 = now();

        buffer.push(7, "ref-a".into(), None, t0);
        buffer.push(7, "ref-b".into(), Some("caption".into()), t0 + Duration::milliseconds(500));
        buffer.push(7, "ref-c".into(), Some("ignored".into()), t0 + Duration::seconds(1));

        // Deadline counts from the first part
        assert!(buffer.take_due(t0 + Duration::seconds(1)).is_empty());

        let flushed = buffer.take_due(t0 + Duration::seconds(2));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].media_refs, vec!["ref-a", "ref-b", "ref-c"]);
        assert_eq!(flushed[0].caption.as_deref(), Some("caption"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn groups_flush_independently() {
        let mut buffer = AlbumBuffer::new();
        let t0 = now();

        buffer.push(1, "early".into(), None, t0);
        buffer.push(2, "late".into(), None, t0 + Duration::seconds(5));

        let first = buffer.take_due(t0 + Duration::seconds(3));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].group_id, 1);
        assert_eq!(buffer.len(), 1);

        let second = buffer.take_due(t0 + Duration::seconds(10));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].group_id, 2);
    }

    #[test]
    fn flushed_group_id_can_be_reused() {
        let mut buffer = AlbumBuffer::new();
        let t0 = now();

        buffer.push(9, "first-round".into(), None, t0);
        assert_eq!(buffer.take_due(t0 + Duration::seconds(3)).len(), 1);

        buffer.push(9, "second-round".into(), None, t0 + Duration::minutes(1));
        let flushed = buffer.take_due(t0 + Duration::minutes(2));
        assert_eq!(flushed[0].media_refs, vec!["second-round"]);
    }
}
