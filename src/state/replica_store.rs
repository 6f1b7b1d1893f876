//! Replica State Store
//!
//! Typed access to replica records, leader records and recovery markers.
//! Every mutation is a read-modify-write against one key with an expected
//! version; conflicts are resolved here by re-reading and re-deciding, so
//! callers never see `Error::StoreConflict`.

use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use super::{LeaderRecord, RecoveryMarker, ReplicaId, ReplicaRecord, ReplicaState, ShardId, ShardView};
use crate::error::{Error, Result};
use crate::index::Offset;
use crate::store::{CoordinationStore, ExpectedVersion, Versioned, WatchStream};

/// Decision taken by an update closure on the current value of a key
#[derive(Debug, Clone, PartialEq)]
pub enum Update<T> {
    /// Leave the key as it is
    Keep,
    /// Write a new value
    Put(T),
    /// Remove the key
    Delete,
}

/// What an update ended up doing
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateResult<T> {
    /// Nothing written; carries the value that was current
    Unchanged(Option<Versioned<T>>),
    /// New value written
    Written(Versioned<T>),
    /// Key removed
    Deleted,
}

/// A state publication made by a replica about itself
#[derive(Debug, Clone, PartialEq)]
pub struct StatePublication {
    pub state: ReplicaState,
    /// Leader generation the replica currently follows
    pub generation: u64,
    pub last_offset: Offset,
    pub recovery_ref: Option<Uuid>,
}

/// Typed client for replica lifecycle state and recovery markers
#[derive(Clone)]
pub struct ReplicaStateStore {
    store: Arc<dyn CoordinationStore>,
}

impl ReplicaStateStore {
    /// Wrap a coordination store client
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Versioned<T>>> {
        match self.store.read(key).await? {
            Some(raw) => {
                let value = serde_json::from_slice(&raw.value)?;
                Ok(Some(Versioned {
                    value,
                    version: raw.version,
                }))
            }
            None => Ok(None),
        }
    }

    async fn list_json<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<Versioned<T>>> {
        let mut values = Vec::new();
        for (_, raw) in self.store.list(prefix).await? {
            values.push(Versioned {
                value: serde_json::from_slice(&raw.value)?,
                version: raw.version,
            });
        }
        Ok(values)
    }

    /// Read-modify-write loop on one key
    async fn update_json<T, F>(&self, key: &str, mut decide: F) -> Result<UpdateResult<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Option<&T>) -> Result<Update<T>>,
    {
        loop {
            let current: Option<Versioned<T>> = self.read_json(key).await?;
            let expected = match &current {
                Some(c) => ExpectedVersion::Exactly(c.version),
                None => ExpectedVersion::Absent,
            };

            let outcome = match decide(current.as_ref().map(|c| &c.value))? {
                Update::Keep => return Ok(UpdateResult::Unchanged(current)),
                Update::Put(value) => {
                    let bytes = serde_json::to_vec(&value)?;
                    self.store
                        .write(key, bytes, expected)
                        .await
                        .map(|version| UpdateResult::Written(Versioned { value, version }))
                }
                Update::Delete => {
                    if current.is_none() {
                        return Ok(UpdateResult::Unchanged(None));
                    }
                    self.store
                        .delete(key, expected)
                        .await
                        .map(|_| UpdateResult::Deleted)
                }
            };

            match outcome {
                Err(e) if e.is_conflict() => {
                    tracing::debug!("Store conflict on {}, re-reading: {}", key, e);
                    tokio::task::yield_now().await;
                }
                other => return other,
            }
        }
    }

    // ========== Replica records ==========

    /// Register a replica, keeping its published state if it already exists
    pub async fn register_replica(
        &self,
        shard: &ShardId,
        replica: &ReplicaId,
        address: &str,
    ) -> Result<ReplicaRecord> {
        let result = self
            .update_json(&shard.replica_key(replica), |current: Option<&ReplicaRecord>| {
                Ok(match current {
                    Some(record) if record.address == address => Update::Keep,
                    Some(record) => Update::Put(ReplicaRecord {
                        address: address.to_string(),
                        updated_at: Utc::now(),
                        ..record.clone()
                    }),
                    None => Update::Put(ReplicaRecord::new(
                        replica.clone(),
                        shard.clone(),
                        address.to_string(),
                    )),
                })
            })
            .await?;

        match result {
            UpdateResult::Written(v) => Ok(v.value),
            UpdateResult::Unchanged(Some(v)) => Ok(v.value),
            _ => Err(Error::Internal(format!("replica {} vanished during registration", replica))),
        }
    }

    /// Read one replica record
    pub async fn replica(&self, shard: &ShardId, replica: &ReplicaId) -> Result<Option<Versioned<ReplicaRecord>>> {
        self.read_json(&shard.replica_key(replica)).await
    }

    /// Read every replica record of a shard, ordered by id
    pub async fn replicas(&self, shard: &ShardId) -> Result<Vec<ReplicaRecord>> {
        Ok(self
            .list_json::<ReplicaRecord>(&shard.replicas_prefix())
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    /// Publish a replica's own state transition
    pub async fn publish_state(
        &self,
        shard: &ShardId,
        replica: &ReplicaId,
        publication: StatePublication,
    ) -> Result<Versioned<ReplicaRecord>> {
        let result = self
            .update_json(&shard.replica_key(replica), |current: Option<&ReplicaRecord>| {
                let record = current.ok_or_else(|| Error::ReplicaNotFound(replica.to_string()))?;
                Ok(Update::Put(ReplicaRecord {
                    state: publication.state,
                    generation: record.generation.max(publication.generation),
                    last_offset: publication.last_offset,
                    recovery_ref: publication.recovery_ref,
                    updated_at: Utc::now(),
                    ..record.clone()
                }))
            })
            .await?;

        match result {
            UpdateResult::Written(v) => {
                tracing::info!(
                    "Replica {} of {} published {} (generation {}, offset {})",
                    replica,
                    shard,
                    v.value.state,
                    v.value.generation,
                    v.value.last_offset
                );
                Ok(v)
            }
            _ => Err(Error::Internal(format!("state publication for {} was not written", replica))),
        }
    }

    // ========== Recovery markers ==========

    /// Read the marker addressed to a replica
    pub async fn marker(&self, shard: &ShardId, replica: &ReplicaId) -> Result<Option<Versioned<RecoveryMarker>>> {
        self.read_json(&shard.marker_key(replica)).await
    }

    /// Read every outstanding marker of a shard
    pub async fn markers(&self, shard: &ShardId) -> Result<Vec<RecoveryMarker>> {
        Ok(self
            .list_json::<RecoveryMarker>(&shard.markers_prefix())
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    /// Conditionally create, replace or delete a marker
    pub async fn update_marker<F>(
        &self,
        shard: &ShardId,
        replica: &ReplicaId,
        decide: F,
    ) -> Result<UpdateResult<RecoveryMarker>>
    where
        F: FnMut(Option<&RecoveryMarker>) -> Result<Update<RecoveryMarker>>,
    {
        self.update_json(&shard.marker_key(replica), decide).await
    }

    /// Delete a marker only if it is still the given issue at the given generation.
    /// Returns true if this call removed it.
    pub async fn clear_marker(
        &self,
        shard: &ShardId,
        replica: &ReplicaId,
        marker_id: Uuid,
        leader_generation: u64,
    ) -> Result<bool> {
        let result = self
            .update_marker(shard, replica, |current| {
                Ok(match current {
                    Some(m) if m.id == marker_id && m.leader_generation == leader_generation => Update::Delete,
                    _ => Update::Keep,
                })
            })
            .await?;
        Ok(matches!(result, UpdateResult::Deleted))
    }

    // ========== Leader records ==========

    /// Read the leader record of a shard
    pub async fn leader(&self, shard: &ShardId) -> Result<Option<Versioned<LeaderRecord>>> {
        self.read_json(&shard.leader_key()).await
    }

    /// Conditionally create, replace or delete the leader record
    pub async fn update_leader<F>(&self, shard: &ShardId, decide: F) -> Result<UpdateResult<LeaderRecord>>
    where
        F: FnMut(Option<&LeaderRecord>) -> Result<Update<LeaderRecord>>,
    {
        self.update_json(&shard.leader_key(), decide).await
    }

    /// Everything stored for a shard, from one pass over the store
    pub async fn shard_view(&self, shard: &ShardId) -> Result<ShardView> {
        Ok(ShardView {
            shard: shard.clone(),
            leader: self.leader(shard).await?.map(|v| v.value),
            replicas: self.replicas(shard).await?,
            markers: self.markers(shard).await?,
        })
    }

    // ========== Watches ==========

    /// Watch the marker addressed to one replica
    pub fn watch_marker(&self, shard: &ShardId, replica: &ReplicaId) -> WatchStream {
        self.store.watch(&shard.marker_key(replica))
    }

    /// Watch every replica record of a shard
    pub fn watch_replicas(&self, shard: &ShardId) -> WatchStream {
        self.store.watch(&shard.replicas_prefix())
    }

    /// Watch every marker of a shard
    pub fn watch_markers(&self, shard: &ShardId) -> WatchStream {
        self.store.watch(&shard.markers_prefix())
    }

    /// Watch the leader record of a shard
    pub fn watch_leader(&self, shard: &ShardId) -> WatchStream {
        self.store.watch(&shard.leader_key())
    }
}
