//! Per-prefix actuation locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per region prefix, created on first use.
#[derive(Clone, Default)]
pub struct PrefixLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl PrefixLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `prefix`.
    pub async fn lock(&self, prefix: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().expect("prefix locks");
            locks
                .entry(prefix.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
