//! In-Memory Coordination Store
//!
//! Linearizable store for single-process clusters and tests. All keys live
//! in one map guarded by a lock; versions come from a single counter so a
//! deleted-then-recreated key never repeats a version.

use std::collections::BTreeMap;
use tokio::sync::{broadcast, RwLock};

use super::{
    conflict, prefix_stream, CoordinationStore, ExpectedVersion, Version, Versioned, WatchEvent,
    WatchStream,
};
use crate::error::Result;

/// Capacity of the notification channel before watchers start lagging
const WATCH_CAPACITY: usize = 4096;

struct Inner {
    entries: BTreeMap<String, Versioned<Vec<u8>>>,
    last_version: Version,
}

/// In-memory coordination store
pub struct MemoryStore {
    inner: RwLock<Inner>,
    events: broadcast::Sender<WatchEvent>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                entries: BTreeMap::new(),
                last_version: 0,
            }),
            events,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CoordinationStore for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<Versioned<Vec<u8>>>> {
        let inner = self.inner.read().await;
        Ok(inner.entries.get(key).cloned())
    }

    async fn write(&self, key: &str, value: Vec<u8>, expected: ExpectedVersion) -> Result<Version> {
        let mut inner = self.inner.write().await;
        let current = inner.entries.get(key).map(|e| e.version);
        if !expected.matches(current) {
            return Err(conflict(key, expected, current));
        }

        inner.last_version += 1;
        let version = inner.last_version;
        inner.entries.insert(key.to_string(), Versioned { value, version });

        // Sent under the lock so subscribers observe per-key order
        let _ = self.events.send(WatchEvent::Put {
            key: key.to_string(),
            version,
        });
        Ok(version)
    }

    async fn delete(&self, key: &str, expected: ExpectedVersion) -> Result<()> {
        let mut inner = self.inner.write().await;
        let current = inner.entries.get(key).map(|e| e.version);
        if current.is_none() || !expected.matches(current) {
            return Err(conflict(key, expected, current));
        }

        inner.entries.remove(key);
        let _ = self.events.send(WatchEvent::Deleted { key: key.to_string() });
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned<Vec<u8>>)>> {
        let inner = self.inner.read().await;
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn watch(&self, prefix: &str) -> WatchStream {
        prefix_stream(self.events.subscribe(), prefix)
    }
}
