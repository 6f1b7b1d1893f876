//! ShardSync Error Types

use thiserror::Error;

use crate::replication::protocol::ErrorCode;

/// Result type alias for ShardSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// ShardSync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Coordination store errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Store conflict on {key}: expected {expected}, found {actual}")]
    StoreConflict {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    // Transport errors
    #[error("No response from {0}")]
    NoResponse(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Connection reset by {0}")]
    ConnectionReset(String),

    #[error("Request rejected by {address} ({code:?}): {message}")]
    Rejected {
        address: String,
        code: ErrorCode,
        message: String,
    },

    #[error("Network error: {0}")]
    Network(String),

    // Authority errors
    #[error("Stale authority on {shard}: marker generation {marker_generation}, leader generation {leader_generation}")]
    StaleAuthority {
        shard: String,
        marker_generation: u64,
        leader_generation: u64,
    },

    #[error("Not leader of {shard}: current leader is {leader}")]
    NotLeader { shard: String, leader: String },

    #[error("No leader available for {0}")]
    NoLeader(String),

    #[error("Stale leader on {shard}: update from generation {generation}, current generation {current}")]
    StaleLeader {
        shard: String,
        generation: u64,
        current: u64,
    },

    // Recovery errors
    #[error("Recovery data unavailable: requested offset {requested}, oldest retained {oldest}")]
    RecoveryDataUnavailable { requested: u64, oldest: u64 },

    #[error("Out of sequence: expected offset {expected}, got {got}")]
    OutOfSequence { expected: u64, got: u64 },

    #[error("Recovery failed for {replica}: {reason}")]
    RecoveryFailed { replica: String, reason: String },

    #[error("Replica {replica} is {state} and not accepting updates")]
    ReplicaUnavailable { replica: String, state: String },

    // Lookup errors
    #[error("Shard not found: {0}")]
    ShardNotFound(String),

    #[error("Replica not found: {0}")]
    ReplicaNotFound(String),

    // Request errors
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is an optimistic-write collision
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::StoreConflict { .. })
    }

    /// Check if the peer never answered (or could not be reached at all)
    pub fn is_no_response(&self) -> bool {
        matches!(
            self,
            Error::NoResponse(_)
                | Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionReset(_)
        )
    }
}
