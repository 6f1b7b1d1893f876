//! Shard Leader Election
//!
//! Leadership of a shard is a lease held in the shard's leader record.
//! Taking the lease is a compare-and-set that bumps the generation, so every
//! tenure has a distinct, increasing generation even across resignations.
//! Lookups retry with backoff because the record may be briefly missing or
//! expired right after a leader change.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;

use super::replica_store::{ReplicaStateStore, Update, UpdateResult};
use super::{LeaderRecord, ReplicaId, ShardId};
use crate::config::ElectionConfig;
use crate::error::{Error, Result};

/// Upper bound on a single lookup backoff step
const MAX_LOOKUP_BACKOFF: Duration = Duration::from_secs(2);

/// Determines and re-determines the leader of each shard
pub struct ShardLeaderElector {
    store: ReplicaStateStore,
    config: ElectionConfig,
}

impl ShardLeaderElector {
    /// Create a new elector
    pub fn new(store: ReplicaStateStore, config: ElectionConfig) -> Self {
        Self { store, config }
    }

    /// Election configuration
    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    fn lease_deadline(&self) -> chrono::DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(self.config.lease_ms as i64)
    }

    /// Randomized delay before standing for election, so replicas that notice
    /// an expired lease at the same moment do not all race for it
    pub fn election_delay(&self) -> Duration {
        let mut rng = rand::thread_rng();
        let ms = rng.gen_range(self.config.election_delay_min_ms..=self.config.election_delay_max_ms);
        Duration::from_millis(ms)
    }

    /// Read the leader record once; None if absent or its lease expired
    pub async fn live_leader(&self, shard: &ShardId) -> Result<Option<LeaderRecord>> {
        let now = Utc::now();
        Ok(self
            .store
            .leader(shard)
            .await?
            .map(|v| v.value)
            .filter(|leader| leader.is_live(now)))
    }

    /// Current leader of a shard, retrying with backoff while none is live
    pub async fn current_leader(&self, shard: &ShardId) -> Result<LeaderRecord> {
        let attempts = self.config.leader_retry_attempts.max(1);
        let mut backoff = Duration::from_millis(self.config.leader_retry_backoff_ms);

        for attempt in 1..=attempts {
            if let Some(leader) = self.live_leader(shard).await? {
                return Ok(leader);
            }

            if attempt < attempts {
                tracing::debug!(
                    "No live leader for {} (attempt {}/{}), retrying in {:?}",
                    shard,
                    attempt,
                    attempts,
                    backoff
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_LOOKUP_BACKOFF);
            }
        }

        Err(Error::NoLeader(shard.to_string()))
    }

    /// Highest generation any record of the shard refers to
    async fn generation_floor(&self, shard: &ShardId) -> Result<u64> {
        let view = self.store.shard_view(shard).await?;
        let from_leader = view.leader.map(|l| l.generation).unwrap_or(0);
        let from_replicas = view.replicas.iter().map(|r| r.generation).max().unwrap_or(0);
        let from_markers = view.markers.iter().map(|m| m.leader_generation).max().unwrap_or(0);
        Ok(from_leader.max(from_replicas).max(from_markers))
    }

    /// Try to take the leader lease. Returns the new record if this replica
    /// now leads, or None if another replica holds a live lease.
    pub async fn try_become_leader(
        &self,
        shard: &ShardId,
        candidate: &ReplicaId,
        address: &str,
    ) -> Result<Option<LeaderRecord>> {
        let floor = self.generation_floor(shard).await?;

        let result = self
            .store
            .update_leader(shard, |current| {
                let now = Utc::now();
                Ok(match current {
                    Some(leader) if leader.is_live(now) => Update::Keep,
                    _ => {
                        let previous = current.map(|l| l.generation).unwrap_or(0);
                        Update::Put(LeaderRecord {
                            shard: shard.clone(),
                            replica: candidate.clone(),
                            address: address.to_string(),
                            generation: previous.max(floor) + 1,
                            elected_at: now,
                            lease_expires_at: self.lease_deadline(),
                        })
                    }
                })
            })
            .await?;

        match result {
            UpdateResult::Written(v) => {
                tracing::info!(
                    "Replica {} won leadership of {} at generation {}",
                    candidate,
                    shard,
                    v.value.generation
                );
                Ok(Some(v.value))
            }
            UpdateResult::Unchanged(Some(v)) if &v.value.replica == candidate => Ok(Some(v.value)),
            _ => Ok(None),
        }
    }

    /// Extend the lease of the current tenure.
    /// Fails with `NotLeader` if the tenure ended.
    pub async fn renew_lease(
        &self,
        shard: &ShardId,
        leader: &ReplicaId,
        generation: u64,
    ) -> Result<LeaderRecord> {
        let result = self
            .store
            .update_leader(shard, |current| match current {
                Some(record) if &record.replica == leader && record.generation == generation => {
                    Ok(Update::Put(LeaderRecord {
                        lease_expires_at: self.lease_deadline(),
                        ..record.clone()
                    }))
                }
                Some(record) => Err(Error::NotLeader {
                    shard: shard.to_string(),
                    leader: record.replica.to_string(),
                }),
                None => Err(Error::NoLeader(shard.to_string())),
            })
            .await?;

        match result {
            UpdateResult::Written(v) => Ok(v.value),
            _ => Err(Error::Internal(format!("lease renewal for {} was not written", shard))),
        }
    }

    /// Give up the lease at the end of a tenure. The record stays so the
    /// generation keeps counting; only the lease is expired.
    pub async fn resign(&self, shard: &ShardId, leader: &ReplicaId, generation: u64) -> Result<bool> {
        let result = self
            .store
            .update_leader(shard, |current| {
                Ok(match current {
                    Some(record) if &record.replica == leader && record.generation == generation => {
                        Update::Put(LeaderRecord {
                            lease_expires_at: Utc::now(),
                            ..record.clone()
                        })
                    }
                    _ => Update::Keep,
                })
            })
            .await?;

        let resigned = matches!(result, UpdateResult::Written(_));
        if resigned {
            tracing::info!("Replica {} resigned leadership of {} (generation {})", leader, shard, generation);
        }
        Ok(resigned)
    }
}
