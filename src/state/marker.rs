//! Recovery Markers
//!
//! A marker is the leader's durable statement that a replica owes a
//! recovery. Its presence in the store is authoritative.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ReplicaId, ReplicaState, ShardId};

/// Why the leader asked for a recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarkerReason {
    /// A forwarded update could not be delivered
    UpdateFailed { error: String },
    /// An operator asked for the recovery to be retried
    OperatorRequest,
    /// The replica published a recovery state of its own (startup,
    /// step-down or a new generation) that no marker covered
    ReplicaReported { state: ReplicaState },
}

impl std::fmt::Display for MarkerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarkerReason::UpdateFailed { error } => write!(f, "update failed: {}", error),
            MarkerReason::OperatorRequest => write!(f, "operator request"),
            MarkerReason::ReplicaReported { state } => write!(f, "replica reported {}", state),
        }
    }
}

/// Recovery marker addressed to one replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryMarker {
    /// Marker identity; stays the same when only the generation is refreshed
    pub id: Uuid,
    pub shard: ShardId,
    pub replica: ReplicaId,
    /// Leader that wrote (or last refreshed) the marker
    pub leader: ReplicaId,
    /// Generation of that leader
    pub leader_generation: u64,
    pub reason: MarkerReason,
    /// 1 for the first issue, incremented on every reissue after RECOVERY_FAILED
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    /// Set by the leader when the recovery made no progress within the timeout
    #[serde(default)]
    pub timed_out_at: Option<DateTime<Utc>>,
}

impl RecoveryMarker {
    /// Create a fresh marker
    pub fn new(
        shard: ShardId,
        replica: ReplicaId,
        leader: ReplicaId,
        leader_generation: u64,
        reason: MarkerReason,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            shard,
            replica,
            leader,
            leader_generation,
            reason,
            attempt: 1,
            created_at: Utc::now(),
            timed_out_at: None,
        }
    }

    /// Same marker stamped with a newer leader's authority
    pub fn refreshed(&self, leader: ReplicaId, leader_generation: u64) -> Self {
        Self {
            leader,
            leader_generation,
            ..self.clone()
        }
    }

    /// New issue of a marker whose recovery failed
    pub fn reissued(&self, leader: ReplicaId, leader_generation: u64, reason: MarkerReason) -> Self {
        Self {
            id: Uuid::new_v4(),
            leader,
            leader_generation,
            reason,
            attempt: self.attempt + 1,
            created_at: Utc::now(),
            timed_out_at: None,
            ..self.clone()
        }
    }

    /// Check if the marker was written under the given leader generation
    pub fn is_current(&self, leader_generation: u64) -> bool {
        self.leader_generation == leader_generation
    }
}
