//! Coordination Store
//!
//! Client abstraction over the metadata store that holds replica state,
//! leader records and recovery markers. Every mutation is a compare-and-set
//! against a store-wide version; watchers receive change notifications for
//! a key prefix.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Store-wide version. Strictly increasing across all keys.
pub type Version = u64;

/// Stream of change notifications returned by [`CoordinationStore::watch`].
/// Dropping the stream cancels the subscription.
pub type WatchStream = Pin<Box<dyn Stream<Item = WatchEvent> + Send>>;

/// A value together with the version that wrote it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

impl<T> Versioned<T> {
    /// Transform the value, keeping the version
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Versioned<U> {
        Versioned {
            value: f(self.value),
            version: self.version,
        }
    }
}

/// Precondition for a conditional write or delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Unconditional
    Any,
    /// Key must not exist
    Absent,
    /// Key must exist at exactly this version
    Exactly(Version),
}

impl ExpectedVersion {
    /// Check the precondition against the current version of a key
    pub fn matches(&self, current: Option<Version>) -> bool {
        match (self, current) {
            (ExpectedVersion::Any, _) => true,
            (ExpectedVersion::Absent, None) => true,
            (ExpectedVersion::Exactly(v), Some(c)) => *v == c,
            _ => false,
        }
    }
}

impl std::fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpectedVersion::Any => write!(f, "any"),
            ExpectedVersion::Absent => write!(f, "absent"),
            ExpectedVersion::Exactly(v) => write!(f, "v{}", v),
        }
    }
}

/// Change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Key created or overwritten
    Put { key: String, version: Version },
    /// Key removed
    Deleted { key: String },
    /// Notifications were dropped; the watcher must re-read what it cares about
    Lagged,
}

impl WatchEvent {
    /// Key this event refers to (None for `Lagged`)
    pub fn key(&self) -> Option<&str> {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Deleted { key } => Some(key),
            WatchEvent::Lagged => None,
        }
    }
}

/// Coordination store client
#[async_trait::async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read a key
    async fn read(&self, key: &str) -> Result<Option<Versioned<Vec<u8>>>>;

    /// Write a key if `expected` holds, returning the new version.
    /// Fails with `Error::StoreConflict` otherwise.
    async fn write(&self, key: &str, value: Vec<u8>, expected: ExpectedVersion) -> Result<Version>;

    /// Delete a key if `expected` holds.
    /// Fails with `Error::StoreConflict` otherwise.
    async fn delete(&self, key: &str, expected: ExpectedVersion) -> Result<()>;

    /// List all keys under a prefix, ordered by key
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned<Vec<u8>>)>>;

    /// Subscribe to changes of every key under a prefix
    fn watch(&self, prefix: &str) -> WatchStream;
}

pub(crate) fn conflict(key: &str, expected: ExpectedVersion, current: Option<Version>) -> crate::Error {
    crate::Error::StoreConflict {
        key: key.to_string(),
        expected: expected.to_string(),
        actual: match current {
            Some(v) => format!("v{}", v),
            None => "absent".to_string(),
        },
    }
}

/// Turn a broadcast receiver of store events into a prefix-filtered watch stream
pub(crate) fn prefix_stream(
    rx: tokio::sync::broadcast::Receiver<WatchEvent>,
    prefix: &str,
) -> WatchStream {
    use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
    use tokio_stream::wrappers::BroadcastStream;
    use tokio_stream::StreamExt;

    let prefix = prefix.to_string();
    let stream = BroadcastStream::new(rx).filter_map(move |item| match item {
        Ok(event) => match event.key() {
            Some(key) if key.starts_with(&prefix) => Some(event),
            Some(_) => None,
            None => Some(event),
        },
        Err(BroadcastStreamRecvError::Lagged(_)) => Some(WatchEvent::Lagged),
    });
    Box::pin(stream)
}
