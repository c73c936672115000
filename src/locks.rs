use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-record async locks keyed by post/broadcast id.
///
/// The periodic driver and one-shot timers may both touch the same record;
/// holding its key for the whole read-modify-write prevents double-publishing
/// and double-deleting. Unrelated records are never blocked — each key has
/// its own mutex.
#[derive(Default)]
pub struct RecordLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RecordLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut inner = self.inner.lock().unwrap();
            Arc::clone(inner.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}
