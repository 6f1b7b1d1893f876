//! Index Engine
//!
//! The per-shard document store that replication feeds. The leader assigns
//! offsets by appending; replicas apply the leader's operations in offset
//! order. Retained history serves incremental replay, snapshots serve
//! replicas that fell too far behind.

mod memory;

pub use memory::MemoryIndex;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Position of an operation in a shard's update stream. 0 means "nothing applied".
pub type Offset = u64;

/// Field value of a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Convert from a JSON value; objects are kept as their JSON text
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => FieldValue::Null,
            serde_json::Value::Bool(b) => FieldValue::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => FieldValue::Int(i),
                None => FieldValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => FieldValue::String(s.clone()),
            serde_json::Value::Array(items) => {
                FieldValue::List(items.iter().map(FieldValue::from_json).collect())
            }
            serde_json::Value::Object(_) => FieldValue::String(value.to_string()),
        }
    }

    /// Convert to a JSON value
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Null => serde_json::Value::Null,
            FieldValue::Bool(b) => serde_json::Value::Bool(*b),
            FieldValue::Int(i) => serde_json::Value::from(*i),
            FieldValue::Float(f) => serde_json::Value::from(*f),
            FieldValue::String(s) => serde_json::Value::String(s.clone()),
            FieldValue::List(items) => {
                serde_json::Value::Array(items.iter().map(FieldValue::to_json).collect())
            }
        }
    }
}

/// Document body: field name to value
pub type Document = BTreeMap<String, FieldValue>;

/// Convert a JSON object into a document
pub fn document_from_json(value: &serde_json::Value) -> Result<Document> {
    let object = value
        .as_object()
        .ok_or_else(|| Error::InvalidDocument("fields must be a JSON object".into()))?;
    Ok(object
        .iter()
        .map(|(name, v)| (name.clone(), FieldValue::from_json(v)))
        .collect())
}

/// Convert a document into a JSON object
pub fn document_to_json(document: &Document) -> serde_json::Value {
    serde_json::Value::Object(
        document
            .iter()
            .map(|(name, v)| (name.clone(), v.to_json()))
            .collect(),
    )
}

/// What a write does to the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Add or replace a document
    Update { doc_id: String, fields: Document },
    /// Remove a document
    Delete { doc_id: String },
    /// Make everything up to this offset durable and visible
    Commit,
}

impl OperationKind {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Update { .. } => "update",
            OperationKind::Delete { .. } => "delete",
            OperationKind::Commit => "commit",
        }
    }
}

/// An operation with its leader-assigned offset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub offset: Offset,
    pub kind: OperationKind,
}

/// Result of applying a leader operation on a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Operation applied; the index advanced to its offset
    Applied,
    /// Offset already applied; nothing changed
    Duplicate,
}

/// Point-in-time copy of an index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Last offset included
    pub offset: Offset,
    /// Last committed offset at snapshot time
    pub committed_offset: Offset,
    pub documents: BTreeMap<String, Document>,
}

impl Snapshot {
    /// Encode as lz4-compressed bincode with a trailing CRC32
    pub fn encode(&self) -> Result<Vec<u8>> {
        let serialized = bincode::serialize(self)?;
        let mut data = lz4_flex::compress_prepend_size(&serialized);
        let checksum = crc32fast::hash(&data);
        data.extend_from_slice(&checksum.to_le_bytes());
        Ok(data)
    }

    /// Decode bytes produced by [`Snapshot::encode`]
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(Error::Internal("snapshot too short".into()));
        }
        let (data, checksum_bytes) = bytes.split_at(bytes.len() - 4);
        let mut stored = [0u8; 4];
        stored.copy_from_slice(checksum_bytes);
        if u32::from_le_bytes(stored) != crc32fast::hash(data) {
            return Err(Error::Internal("snapshot checksum mismatch".into()));
        }

        let serialized = lz4_flex::decompress_size_prepended(data)
            .map_err(|e| Error::Internal(format!("snapshot decompression failed: {}", e)))?;
        Ok(bincode::deserialize(&serialized)?)
    }
}

/// Storage engine of one shard copy
#[async_trait::async_trait]
pub trait IndexEngine: Send + Sync {
    /// Assign the next offset to an operation and apply it (leader side)
    async fn append(&self, kind: OperationKind) -> Result<Operation>;

    /// Apply a leader operation in sequence (replica side).
    /// Offsets at or below the last applied one are duplicates; a gap is
    /// `Error::OutOfSequence`.
    async fn apply(&self, operation: &Operation) -> Result<ApplyOutcome>;

    /// Last applied offset
    async fn last_offset(&self) -> Offset;

    /// Last committed offset
    async fn committed_offset(&self) -> Offset;

    /// Up to `limit` operations after `offset`, in order. Fails with
    /// `Error::RecoveryDataUnavailable` if any operation after `offset` is no
    /// longer retained or there are more than `max_gap` of them.
    async fn operations_since(&self, offset: Offset, max_gap: u64, limit: usize) -> Result<Vec<Operation>>;

    /// Copy of the whole index
    async fn snapshot(&self) -> Result<Snapshot>;

    /// Replace the whole index with a snapshot
    async fn install_snapshot(&self, snapshot: Snapshot) -> Result<()>;

    /// Look up a document
    async fn document(&self, doc_id: &str) -> Option<Document>;

    /// Number of documents
    async fn document_count(&self) -> usize;
}
