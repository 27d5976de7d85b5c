use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// One async mutex per `engine:path`, shared by every writer in this process.
#[derive(Clone, Default)]
pub struct PathLocks {
    inner: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, engine: &str, path: &str) -> OwnedMutexGuard<()> {
        let key = format!("{engine}:{path}");
        // Clone the Arc out before awaiting so the shard lock is released.
        let mutex = Arc::clone(&self.inner.entry(key.clone()).or_default());
        let guard = mutex.lock_owned().await;
        debug!(key = %key, "acquired path lock");
        guard
    }
}
