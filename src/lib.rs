//! ShardSync - Shard Replica Synchronization
//!
//! Keeps the replicas of a sharded search index in sync. The leader of each
//! shard assigns offsets to writes and forwards them to its replicas; a
//! replica that cannot be reached is marked for recovery in a shared
//! coordination store, and the replica catches up from the leader on its own.
//!
//! # Architecture
//!
//! Every shard has one leader holding a generation-stamped lease in the
//! coordination store. Replicas publish their lifecycle state (DOWN,
//! RECOVERING, RECOVERY_FAILED, ACTIVE) to the same store, and the leader
//! derives each replica's recovery phase from the replica's published state
//! and the outstanding recovery marker.
//!
//! # Features
//!
//! - Bounded-retry update forwarding with failure classification
//! - Leader-initiated recovery markers with generation fencing
//! - Incremental replay with snapshot fallback
//! - Lease-based leader election per shard
//! - Pluggable coordination store (SQLite or in-memory)
//! - HTTP API for writes, status and recovery retries

pub mod config;
pub mod error;
pub mod store;
pub mod state;
pub mod index;
pub mod replication;
pub mod network;
pub mod api;

pub use config::ShardSyncConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ShardSyncConfig;
    pub use crate::error::{Error, Result};
    pub use crate::index::{IndexEngine, MemoryIndex, Offset, Operation, OperationKind};
    pub use crate::state::{
        LeaderRecord, RecoveryMarker, ReplicaId, ReplicaState, ReplicaStateStore, ShardId,
        ShardLeaderElector,
    };
    pub use crate::store::{CoordinationStore, MemoryStore, SqliteStore};
    pub use crate::replication::{
        LeaderInitiatedRecoveryCoordinator, Message, NodeRuntime, RecoveryPhase,
        ReplicaRecoveryAgent, ShardNode, UpdateForwarder, UpdateOutcome,
    };
}
