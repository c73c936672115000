use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::task::AbortHandle;
use tracing::debug;

/// In-process one-shot timer registry.
///
/// Timers are a latency optimization only — persisted timestamps stay
/// authoritative and are replayed at startup, so losing armed timers on
/// shutdown is safe. Arming an id that already exists replaces the previous
/// timer instead of duplicating it, which is what makes repeated re-arming
/// from ticks and restarts idempotent.
pub struct Timers {
    inner: Mutex<HashMap<String, Entry>>,
}

struct Entry {
    generation: u64,
    handle: AbortHandle,
}

impl Timers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HashMap::new()),
        })
    }

    /// Arm (or re-arm) timer `id` to run `task` at `at`. A due time already in
    /// the past fires immediately.
    pub fn arm<F>(self: &Arc<Self>, id: &str, at: DateTime<Utc>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        let registry = Arc::clone(self);
        let key = id.to_string();

        let mut inner = self.inner.lock().unwrap();
        let generation = inner.get(&key).map(|e| e.generation + 1).unwrap_or(0);

        let spawn_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
            // Deregister, unless a newer timer took the id while we ran
            let mut inner = registry.inner.lock().unwrap();
            if inner.get(&spawn_key).is_some_and(|e| e.generation == generation) {
                inner.remove(&spawn_key);
            }
        })
        .abort_handle();

        if let Some(previous) = inner.insert(key.clone(), Entry { generation, handle }) {
            previous.handle.abort();
            debug!(timer = %key, "replaced armed timer");
        } else {
            debug!(timer = %key, at = %at.to_rfc3339(), "armed timer");
        }
    }

    /// Drop a pending timer. No-op when the id is not armed.
    pub fn cancel(&self, id: &str) {
        if let Some(entry) = self.inner.lock().unwrap().remove(id) {
            entry.handle.abort();
            debug!(timer = %id, "cancelled timer");
        }
    }

    pub fn armed_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn fires_once_at_due_time() {
        let timers = Timers::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let at = Utc::now() + chrono::Duration::seconds(30);
        timers.arm("unpin-p1-1", at, async move {
            let _ = tx.send("fired");
        });

        assert_eq!(timers.armed_count(), 1);
        assert_eq!(rx.recv().await, Some("fired"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(timers.armed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_instead_of_duplicating() {
        let timers = Timers::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let tx1 = tx.clone();
        timers.arm("unpin-p1-1", Utc::now() + chrono::Duration::seconds(60), async move {
            let _ = tx1.send("first");
        });
        timers.arm("unpin-p1-1", Utc::now() + chrono::Duration::seconds(120), async move {
            let _ = tx.send("second");
        });

        assert_eq!(timers.armed_count(), 1);
        assert_eq!(rx.recv().await, Some("second"));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn past_due_fires_immediately() {
        let timers = Timers::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        timers.arm("delete-p1-1", Utc::now() - chrono::Duration::hours(1), async move {
            let _ = tx.send(());
        });
        assert_eq!(rx.recv().await, Some(()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let timers = Timers::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        timers.arm("notify-p1-1", Utc::now() + chrono::Duration::seconds(10), async move {
            let _ = tx.send(());
        });
        timers.cancel("notify-p1-1");

        assert_eq!(timers.armed_count(), 0);
        assert_eq!(rx.recv().await, None);
    }
}
