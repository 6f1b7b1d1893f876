//! In-memory index with bounded operation history

use std::collections::{BTreeMap, VecDeque};

use tokio::sync::RwLock;

use super::{ApplyOutcome, Document, IndexEngine, Offset, Operation, OperationKind, Snapshot};
use crate::error::{Error, Result};

struct Inner {
    documents: BTreeMap<String, Document>,
    last_offset: Offset,
    committed_offset: Offset,
    /// Most recent operations, oldest first
    history: VecDeque<Operation>,
}

impl Inner {
    fn apply_kind(&mut self, offset: Offset, kind: &OperationKind) {
        match kind {
            OperationKind::Update { doc_id, fields } => {
                self.documents.insert(doc_id.clone(), fields.clone());
            }
            OperationKind::Delete { doc_id } => {
                self.documents.remove(doc_id);
            }
            OperationKind::Commit => {
                self.committed_offset = offset;
            }
        }
        self.last_offset = offset;
    }

    fn record(&mut self, operation: Operation, retention: usize) {
        self.history.push_back(operation);
        while self.history.len() > retention {
            self.history.pop_front();
        }
    }

    /// Lowest offset a replay can start from
    fn oldest_replayable(&self) -> Offset {
        match self.history.front() {
            Some(op) => op.offset - 1,
            None => self.last_offset,
        }
    }
}

/// In-memory index engine
pub struct MemoryIndex {
    inner: RwLock<Inner>,
    retention: usize,
}

impl MemoryIndex {
    /// Create an empty index retaining at most `retention` operations
    pub fn new(retention: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                documents: BTreeMap::new(),
                last_offset: 0,
                committed_offset: 0,
                history: VecDeque::new(),
            }),
            retention: retention.max(1),
        }
    }
}

#[async_trait::async_trait]
impl IndexEngine for MemoryIndex {
    async fn append(&self, kind: OperationKind) -> Result<Operation> {
        let mut inner = self.inner.write().await;
        let operation = Operation {
            offset: inner.last_offset + 1,
            kind,
        };
        inner.apply_kind(operation.offset, &operation.kind);
        inner.record(operation.clone(), self.retention);
        Ok(operation)
    }

    async fn apply(&self, operation: &Operation) -> Result<ApplyOutcome> {
        let mut inner = self.inner.write().await;
        let expected = inner.last_offset + 1;

        if operation.offset < expected {
            return Ok(ApplyOutcome::Duplicate);
        }
        if operation.offset > expected {
            return Err(Error::OutOfSequence {
                expected,
                got: operation.offset,
            });
        }

        inner.apply_kind(operation.offset, &operation.kind);
        inner.record(operation.clone(), self.retention);
        Ok(ApplyOutcome::Applied)
    }

    async fn last_offset(&self) -> Offset {
        self.inner.read().await.last_offset
    }

    async fn committed_offset(&self) -> Offset {
        self.inner.read().await.committed_offset
    }

    async fn operations_since(&self, offset: Offset, max_gap: u64, limit: usize) -> Result<Vec<Operation>> {
        let inner = self.inner.read().await;
        let oldest = inner.oldest_replayable();

        // A caller ahead of this index diverged and cannot be repaired by replay
        if offset > inner.last_offset || offset < oldest {
            return Err(Error::RecoveryDataUnavailable {
                requested: offset,
                oldest,
            });
        }
        if inner.last_offset - offset > max_gap {
            return Err(Error::RecoveryDataUnavailable {
                requested: offset,
                oldest: inner.last_offset.saturating_sub(max_gap),
            });
        }

        // History offsets are contiguous, so the first wanted one sits at a known position
        let start = (offset - oldest) as usize;
        Ok(inner.history.range(start..).take(limit).cloned().collect())
    }

    async fn snapshot(&self) -> Result<Snapshot> {
        let inner = self.inner.read().await;
        Ok(Snapshot {
            offset: inner.last_offset,
            committed_offset: inner.committed_offset,
            documents: inner.documents.clone(),
        })
    }

    async fn install_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.documents = snapshot.documents;
        inner.last_offset = snapshot.offset;
        inner.committed_offset = snapshot.committed_offset;
        inner.history.clear();
        Ok(())
    }

    async fn document(&self, doc_id: &str) -> Option<Document> {
        self.inner.read().await.documents.get(doc_id).cloned()
    }

    async fn document_count(&self) -> usize {
        self.inner.read().await.documents.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::FieldValue;

    fn update(doc_id: &str, value: &str) -> OperationKind {
        let mut fields = Document::new();
        fields.insert("a_t".into(), FieldValue::String(value.into()));
        OperationKind::Update {
            doc_id: doc_id.into(),
            fields,
        }
    }

    #[tokio::test]
    async fn test_append_assigns_offsets() {
        let index = MemoryIndex::new(100);
        let op1 = index.append(update("1", "a")).await.unwrap();
        let op2 = index.append(OperationKind::Commit).await.unwrap();

        assert_eq!(op1.offset, 1);
        assert_eq!(op2.offset, 2);
        assert_eq!(index.last_offset().await, 2);
        assert_eq!(index.committed_offset().await, 2);
        assert!(index.document("1").await.is_some());
    }

    #[tokio::test]
    async fn test_apply_in_sequence() {
        let leader = MemoryIndex::new(100);
        let replica = MemoryIndex::new(100);

        let op1 = leader.append(update("1", "a")).await.unwrap();
        let op2 = leader.append(OperationKind::Delete { doc_id: "1".into() }).await.unwrap();
        let op3 = leader.append(update("2", "b")).await.unwrap();

        assert_eq!(replica.apply(&op1).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(replica.apply(&op1).await.unwrap(), ApplyOutcome::Duplicate);

        let err = replica.apply(&op3).await.unwrap_err();
        assert!(matches!(err, Error::OutOfSequence { expected: 2, got: 3 }));

        replica.apply(&op2).await.unwrap();
        replica.apply(&op3).await.unwrap();
        assert!(replica.document("1").await.is_none());
        assert_eq!(replica.document_count().await, 1);
    }

    #[tokio::test]
    async fn test_operations_since_respects_retention() {
        let index = MemoryIndex::new(3);
        for i in 0..5 {
            index.append(update(&i.to_string(), "x")).await.unwrap();
        }

        // Offsets 3..=5 retained; replay may start from 2
        let ops = index.operations_since(2, 100, 10).await.unwrap();
        assert_eq!(ops.iter().map(|o| o.offset).collect::<Vec<_>>(), vec![3, 4, 5]);
        assert!(index.operations_since(5, 100, 10).await.unwrap().is_empty());

        // The slice is cut at `limit`; the gap check still covers the whole tail
        let ops = index.operations_since(3, 100, 1).await.unwrap();
        assert_eq!(ops.iter().map(|o| o.offset).collect::<Vec<_>>(), vec![4]);
        assert!(index.operations_since(2, 2, 1).await.is_err());

        let err = index.operations_since(1, 100, 10).await.unwrap_err();
        assert!(matches!(err, Error::RecoveryDataUnavailable { requested: 1, oldest: 2 }));

        // A caller ahead of the index
        assert!(index.operations_since(9, 100, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_install() {
        let leader = MemoryIndex::new(2);
        for i in 0..4 {
            leader.append(update(&i.to_string(), "x")).await.unwrap();
        }
        leader.append(OperationKind::Commit).await.unwrap();

        let replica = MemoryIndex::new(2);
        replica.append(update("stale", "y")).await.unwrap();
        replica.install_snapshot(leader.snapshot().await.unwrap()).await.unwrap();

        assert_eq!(replica.last_offset().await, 5);
        assert_eq!(replica.committed_offset().await, 5);
        assert_eq!(replica.document_count().await, 4);
        assert!(replica.document("stale").await.is_none());

        // Continues in sequence after the snapshot
        let next = leader.append(update("9", "z")).await.unwrap();
        assert_eq!(replica.apply(&next).await.unwrap(), ApplyOutcome::Applied);
    }
}
