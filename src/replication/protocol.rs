//! Replication Protocol
//!
//! Defines the wire protocol for communication between nodes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::forwarder::UpdateOutcome;
use crate::error::Error;
use crate::index::{Offset, Operation, OperationKind};
use crate::state::{ReplicaId, ReplicaState, ShardId};

/// Update forwarded from a shard leader to one replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub shard: ShardId,
    pub leader: ReplicaId,
    /// Generation of the sending leader
    pub generation: u64,
    pub operation: Operation,
}

/// Result of a write handled by a shard leader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteReceipt {
    pub shard: ShardId,
    /// Offset assigned by the leader
    pub offset: Offset,
    pub leader: ReplicaId,
    pub generation: u64,
    /// Outcome per replica the update was forwarded to
    pub outcomes: BTreeMap<ReplicaId, UpdateOutcome>,
}

/// Status of one hosted shard copy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardStatus {
    pub shard: ShardId,
    pub replica: ReplicaId,
    pub is_leader: bool,
    /// Own generation when leading, followed leader's generation otherwise
    pub generation: u64,
    pub state: ReplicaState,
    pub last_offset: Offset,
    pub committed_offset: Offset,
    pub documents: usize,
}

/// Protocol messages for node communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Client Writes ==========
    /// Write submitted to any replica of a shard
    ClientWrite {
        shard: ShardId,
        kind: OperationKind,
    },

    /// Write accepted by the leader
    WriteResponse {
        receipt: WriteReceipt,
    },

    // ========== Update Forwarding ==========
    /// Update from leader to replica
    Update(UpdateRequest),

    /// Update accepted (applied, duplicate, or buffered for after recovery)
    UpdateAck {
        shard: ShardId,
        replica: ReplicaId,
        offset: Offset,
    },

    // ========== Recovery ==========
    /// Request operations after an offset (from recovering replica to leader)
    OperationsSince {
        shard: ShardId,
        from: Offset,
        /// Larger gaps are answered with `RecoveryDataUnavailable`
        max_operations: u64,
        batch_size: usize,
    },

    /// One batch of operations
    Operations {
        shard: ShardId,
        operations: Vec<Operation>,
        has_more: bool,
    },

    /// Request a full copy of the shard
    SnapshotRequest {
        shard: ShardId,
    },

    /// Encoded snapshot (see `Snapshot::encode`)
    SnapshotResponse {
        shard: ShardId,
        offset: Offset,
        data: Vec<u8>,
    },

    // ========== Status ==========
    /// Status request
    StatusRequest,

    /// Status response
    StatusResponse {
        node_id: String,
        shards: Vec<ShardStatus>,
    },

    // ========== Error ==========
    /// Error response
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Update offset does not follow the replica's last offset
    OutOfSequence,
    /// Sender's generation is older than the current leader's
    StaleLeader,
    /// Receiver does not lead the shard
    NotLeader,
    /// No live leader known
    NoLeader,
    /// Replica is DOWN or RECOVERY_FAILED
    ReplicaUnavailable,
    /// Shard not hosted by the receiver
    ShardNotFound,
    /// Requested history is no longer retained
    RecoveryDataUnavailable,
    /// Node is shutting down
    ShuttingDown,
    /// Internal error
    Internal,
}

impl ErrorCode {
    /// Wire code for a local error
    pub fn of(error: &Error) -> Self {
        match error {
            Error::OutOfSequence { .. } => ErrorCode::OutOfSequence,
            Error::StaleLeader { .. } | Error::StaleAuthority { .. } => ErrorCode::StaleLeader,
            Error::NotLeader { .. } => ErrorCode::NotLeader,
            Error::NoLeader(_) => ErrorCode::NoLeader,
            Error::ReplicaUnavailable { .. } => ErrorCode::ReplicaUnavailable,
            Error::ShardNotFound(_) => ErrorCode::ShardNotFound,
            Error::RecoveryDataUnavailable { .. } => ErrorCode::RecoveryDataUnavailable,
            Error::ShuttingDown | Error::Cancelled => ErrorCode::ShuttingDown,
            Error::Rejected { code, .. } => *code,
            _ => ErrorCode::Internal,
        }
    }
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Error reply for a local error
    pub fn error(error: &Error) -> Self {
        Message::Error {
            code: ErrorCode::of(error),
            message: error.to_string(),
        }
    }

    /// Shard a message is addressed to, if any
    pub fn shard(&self) -> Option<&ShardId> {
        match self {
            Message::ClientWrite { shard, .. }
            | Message::UpdateAck { shard, .. }
            | Message::OperationsSince { shard, .. }
            | Message::Operations { shard, .. }
            | Message::SnapshotRequest { shard }
            | Message::SnapshotResponse { shard, .. } => Some(shard),
            Message::WriteResponse { receipt } => Some(&receipt.shard),
            Message::Update(request) => Some(&request.shard),
            Message::StatusRequest | Message::StatusResponse { .. } | Message::Error { .. } => None,
        }
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::ClientWrite { .. } => "ClientWrite",
            Message::WriteResponse { .. } => "WriteResponse",
            Message::Update(_) => "Update",
            Message::UpdateAck { .. } => "UpdateAck",
            Message::OperationsSince { .. } => "OperationsSince",
            Message::Operations { .. } => "Operations",
            Message::SnapshotRequest { .. } => "SnapshotRequest",
            Message::SnapshotResponse { .. } => "SnapshotResponse",
            Message::StatusRequest => "StatusRequest",
            Message::StatusResponse { .. } => "StatusResponse",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut length = [0u8; 4];
        let mut checksum = [0u8; 4];
        length.copy_from_slice(&bytes[0..4]);
        checksum.copy_from_slice(&bytes[4..8]);
        Self {
            length: u32::from_le_bytes(length),
            checksum: u32::from_le_bytes(checksum),
        }
    }
}
