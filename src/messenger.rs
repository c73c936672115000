use std::future::Future;

use anyhow::Result;

use crate::models::ContentPayload;

/// Boundary to the external messaging endpoint. The scheduler core only ever
/// talks to this trait; the production implementation lives in `telegram.rs`.
///
/// Methods return `impl Future + Send` rather than plain `async fn` so the
/// futures can be driven from spawned timer tasks.
pub trait Messenger: Send + Sync {
    /// Deliver `content` to `chat_id`. Returns the created message ids in
    /// send order (several for an album).
    fn send(&self, chat_id: i64, content: &ContentPayload) -> impl Future<Output = Result<Vec<i64>>> + Send;

    fn pin(&self, chat_id: i64, message_id: i64) -> impl Future<Output = Result<()>> + Send;

    fn unpin(&self, chat_id: i64, message_id: i64) -> impl Future<Output = Result<()>> + Send;

    fn delete_messages(&self, chat_id: i64, message_ids: &[i64]) -> impl Future<Output = Result<()>> + Send;

    /// Operator notification. Callers log failures and move on; a lost
    /// reminder must never escalate.
    fn notify(&self, chat_id: i64, text: &str) -> impl Future<Output = Result<()>> + Send;
}
