//! Replica and Shard Records
//!
//! Data model shared by the leader and replica sides. Records are stored
//! as JSON in the coordination store; local copies are advisory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::index::Offset;

/// Identifier of a shard: a collection plus the shard name within it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    pub collection: String,
    pub shard: String,
}

impl ShardId {
    /// Create a shard identifier
    pub fn new(collection: impl Into<String>, shard: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            shard: shard.into(),
        }
    }

    /// Key prefix of everything stored for this shard
    pub fn key_prefix(&self) -> String {
        format!("/collections/{}/shards/{}/", self.collection, self.shard)
    }

    /// Key of the leader record
    pub fn leader_key(&self) -> String {
        format!("{}leader", self.key_prefix())
    }

    /// Key prefix of replica records
    pub fn replicas_prefix(&self) -> String {
        format!("{}replicas/", self.key_prefix())
    }

    /// Key of one replica record
    pub fn replica_key(&self, replica: &ReplicaId) -> String {
        format!("{}{}", self.replicas_prefix(), replica)
    }

    /// Key prefix of recovery markers
    pub fn markers_prefix(&self) -> String {
        format!("{}recovery/", self.key_prefix())
    }

    /// Key of the recovery marker addressed to one replica
    pub fn marker_key(&self, replica: &ReplicaId) -> String {
        format!("{}{}", self.markers_prefix(), replica)
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.collection, self.shard)
    }
}

/// Identifier of a replica (one core hosting a copy of a shard)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(pub String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state a replica publishes about itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaState {
    /// Not serving (starting up or shut down)
    Down,
    /// Catching up from the leader
    Recovering,
    /// Catch-up failed; waiting for a new marker
    RecoveryFailed,
    /// In sync and accepting updates
    Active,
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaState::Down => write!(f, "DOWN"),
            ReplicaState::Recovering => write!(f, "RECOVERING"),
            ReplicaState::RecoveryFailed => write!(f, "RECOVERY_FAILED"),
            ReplicaState::Active => write!(f, "ACTIVE"),
        }
    }
}

/// Replica record as stored in the coordination store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaRecord {
    /// Replica identifier
    pub id: ReplicaId,
    /// Owning shard
    pub shard: ShardId,
    /// Core network address (host:port)
    pub address: String,
    /// Published lifecycle state
    pub state: ReplicaState,
    /// Highest leader generation this replica has observed. Never decreases.
    pub generation: u64,
    /// Last consistent offset at the time of publication
    pub last_offset: Offset,
    /// Marker the current state refers to (RECOVERING / ACTIVE after recovery / RECOVERY_FAILED)
    #[serde(default)]
    pub recovery_ref: Option<Uuid>,
    /// Time of the last publication
    pub updated_at: DateTime<Utc>,
}

impl ReplicaRecord {
    /// Create a record for a replica that is registering
    pub fn new(id: ReplicaId, shard: ShardId, address: String) -> Self {
        Self {
            id,
            shard,
            address,
            state: ReplicaState::Down,
            generation: 0,
            last_offset: 0,
            recovery_ref: None,
            updated_at: Utc::now(),
        }
    }
}

/// Leader record: the current holder of a shard's leader lease
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderRecord {
    /// Shard led
    pub shard: ShardId,
    /// Leading replica
    pub replica: ReplicaId,
    /// Leader's core address
    pub address: String,
    /// Tenure counter; incremented on every leadership change
    pub generation: u64,
    /// When the tenure started
    pub elected_at: DateTime<Utc>,
    /// Lease deadline; an expired lease means the leader lost the store
    pub lease_expires_at: DateTime<Utc>,
}

impl LeaderRecord {
    /// Check if the lease is still valid
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at > now
    }
}

/// Role of this process for one shard.
/// Role-specific state lives in the variant; behavior is selected by matching on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Holds the leader lease at `generation`
    Leader { generation: u64 },
    /// Follows the leader known at `leader_generation`
    Replica { leader_generation: u64 },
}

impl Role {
    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader { .. })
    }

    /// Generation of the leader this role refers to
    pub fn generation(&self) -> u64 {
        match self {
            Role::Leader { generation } => *generation,
            Role::Replica { leader_generation } => *leader_generation,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Leader { .. } => write!(f, "LEADER"),
            Role::Replica { .. } => write!(f, "REPLICA"),
        }
    }
}

/// Snapshot of a shard as seen by one store read
#[derive(Debug, Clone, Serialize)]
pub struct ShardView {
    pub shard: ShardId,
    pub leader: Option<LeaderRecord>,
    /// Replicas ordered by id
    pub replicas: Vec<ReplicaRecord>,
    pub markers: Vec<super::RecoveryMarker>,
}
