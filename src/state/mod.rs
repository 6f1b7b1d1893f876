//! State Management Module
//!
//! Replica lifecycle records, recovery markers and leader leases, all kept
//! in the coordination store.

mod replica;
mod marker;
mod replica_store;
pub mod election;

pub use replica::{LeaderRecord, ReplicaId, ReplicaRecord, ReplicaState, Role, ShardId, ShardView};
pub use marker::{MarkerReason, RecoveryMarker};
pub use replica_store::{ReplicaStateStore, StatePublication, Update, UpdateResult};
pub use election::ShardLeaderElector;
