//! Per-entity exclusive sections
//!
//! Wrapping a whole ingestion run in the entity's lock closes the
//! check-then-insert race: two runs for the same key can no longer both pass
//! the duplicate check before either persists. Runs for different keys never
//! contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Held for the duration of one run; releases the entity on drop
pub struct EntityGuard {
    _guard: OwnedMutexGuard<()>,
}

/// Lazily-created async mutex per entity key
#[derive(Debug, Default, Clone)]
pub struct EntityLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `entity_key`
    pub async fn acquire(&self, entity_key: &str) -> EntityGuard {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            // idle entries are pruned here so the map stays bounded by in-flight keys
            map.retain(|key, lock| key == entity_key || Arc::strong_count(lock) > 1);
            map.entry(entity_key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        EntityGuard {
            _guard: lock.lock_owned().await,
        }
    }

    /// Number of keys with a live lock entry
    pub fn tracked(&self) -> usize {
        self.inner
            .lock()
            .map(|map| map.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }
}
