//! Replication Module
//!
//! Write propagation from a shard leader to its replicas, and the
//! leader-initiated recovery of replicas that fall out of sync.

pub mod protocol;
pub mod classifier;
pub mod transport;
pub mod forwarder;
pub mod coordinator;
pub mod agent;
pub mod node;

pub use protocol::{ErrorCode, FrameHeader, Message, ShardStatus, UpdateRequest, WriteReceipt};
pub use classifier::{classify, FailureClass, RetryFailure, RetryPolicy};
pub use transport::{
    stream_operations_since, MessageSender, MessageTransport, OperationBatch, ReplayLimits,
    ReplicaTransport, TcpTransport,
};
pub use forwarder::{PendingOutcomes, UpdateForwarder, UpdateOutcome};
pub use coordinator::{
    derive_phase, LeaderInitiatedRecoveryCoordinator, MarkOutcome, RecoveryPhase,
    ReplicaRecoveryStatus,
};
pub use agent::{MarkerAction, ReplicaRecoveryAgent};
pub use node::{NodeRuntime, NodeSettings, ShardNode};
