//! Replica Transport
//!
//! Request/response calls between the leader and replicas of a shard,
//! expressed over any [`MessageSender`]. The TCP network client is the
//! production sender.

use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::StreamExt;

use super::protocol::{Message, UpdateRequest, WriteReceipt};
use crate::error::{Error, Result};
use crate::index::{Offset, Operation, OperationKind, Snapshot};
use crate::network::NetworkClient;
use crate::state::ShardId;

/// Sends one message to an address and returns the reply
#[async_trait::async_trait]
pub trait MessageSender: Send + Sync {
    async fn request(&self, address: &str, message: Message) -> Result<Message>;
}

#[async_trait::async_trait]
impl MessageSender for NetworkClient {
    async fn request(&self, address: &str, message: Message) -> Result<Message> {
        self.send(address, message).await
    }
}

/// One batch of a replay
#[derive(Debug, Clone, PartialEq)]
pub struct OperationBatch {
    pub operations: Vec<Operation>,
    pub has_more: bool,
}

/// Limits of an incremental replay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayLimits {
    /// Larger gaps fall back to a snapshot
    pub max_operations: u64,
    pub batch_size: usize,
}

/// Calls made between replicas of a shard
#[async_trait::async_trait]
pub trait ReplicaTransport: Send + Sync {
    /// Deliver an update to a replica; returns the offset it acknowledged
    async fn send_update(&self, address: &str, request: &UpdateRequest) -> Result<Offset>;

    /// Fetch one batch of operations after `from` from the leader
    async fn fetch_operations(
        &self,
        address: &str,
        shard: &ShardId,
        from: Offset,
        limits: ReplayLimits,
    ) -> Result<OperationBatch>;

    /// Fetch a full snapshot from the leader
    async fn fetch_snapshot(&self, address: &str, shard: &ShardId) -> Result<Snapshot>;

    /// Submit a client write to the leader
    async fn forward_write(&self, address: &str, shard: &ShardId, kind: OperationKind) -> Result<WriteReceipt>;
}

/// Stream every operation after `from`, following `has_more` batch by batch
pub fn stream_operations_since(
    transport: Arc<dyn ReplicaTransport>,
    address: String,
    shard: ShardId,
    from: Offset,
    limits: ReplayLimits,
) -> BoxStream<'static, Result<Vec<Operation>>> {
    stream::try_unfold(Some(from), move |next| {
        let transport = Arc::clone(&transport);
        let address = address.clone();
        let shard = shard.clone();
        async move {
            let Some(from) = next else {
                return Ok(None);
            };

            let batch = transport.fetch_operations(&address, &shard, from, limits).await?;
            let last = batch.operations.last().map(|op| op.offset);
            let next = match (batch.has_more, last) {
                (true, Some(last)) if last > from => Some(last),
                (true, _) => {
                    return Err(Error::Network(format!(
                        "replay from {} made no progress at offset {}",
                        address, from
                    )))
                }
                (false, _) => None,
            };

            if batch.operations.is_empty() {
                Ok(None)
            } else {
                Ok(Some((batch.operations, next)))
            }
        }
    })
    .boxed()
}

/// [`ReplicaTransport`] over a message sender
pub struct MessageTransport<S> {
    sender: S,
}

/// Transport used by nodes in production
pub type TcpTransport = MessageTransport<NetworkClient>;

impl<S: MessageSender> MessageTransport<S> {
    pub fn new(sender: S) -> Self {
        Self { sender }
    }

    /// Underlying sender
    pub fn sender(&self) -> &S {
        &self.sender
    }

    async fn call(&self, address: &str, message: Message) -> Result<Message> {
        match self.sender.request(address, message).await? {
            Message::Error { code, message } => Err(Error::Rejected {
                address: address.to_string(),
                code,
                message,
            }),
            reply => Ok(reply),
        }
    }
}

fn unexpected(address: &str, reply: &Message) -> Error {
    Error::Network(format!("unexpected {} from {}", reply.type_name(), address))
}

#[async_trait::async_trait]
impl<S: MessageSender> ReplicaTransport for MessageTransport<S> {
    async fn send_update(&self, address: &str, request: &UpdateRequest) -> Result<Offset> {
        match self.call(address, Message::Update(request.clone())).await? {
            Message::UpdateAck { offset, .. } => Ok(offset),
            reply => Err(unexpected(address, &reply)),
        }
    }

    async fn fetch_operations(
        &self,
        address: &str,
        shard: &ShardId,
        from: Offset,
        limits: ReplayLimits,
    ) -> Result<OperationBatch> {
        let request = Message::OperationsSince {
            shard: shard.clone(),
            from,
            max_operations: limits.max_operations,
            batch_size: limits.batch_size,
        };
        match self.call(address, request).await? {
            Message::Operations {
                operations,
                has_more,
                ..
            } => Ok(OperationBatch {
                operations,
                has_more,
            }),
            reply => Err(unexpected(address, &reply)),
        }
    }

    async fn fetch_snapshot(&self, address: &str, shard: &ShardId) -> Result<Snapshot> {
        let request = Message::SnapshotRequest { shard: shard.clone() };
        match self.call(address, request).await? {
            Message::SnapshotResponse { data, .. } => Snapshot::decode(&data),
            reply => Err(unexpected(address, &reply)),
        }
    }

    async fn forward_write(&self, address: &str, shard: &ShardId, kind: OperationKind) -> Result<WriteReceipt> {
        let request = Message::ClientWrite {
            shard: shard.clone(),
            kind,
        };
        match self.call(address, request).await? {
            Message::WriteResponse { receipt } => Ok(receipt),
            reply => Err(unexpected(address, &reply)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexEngine, MemoryIndex};
    use crate::replication::protocol::ErrorCode;

    /// Serves replay requests from an index, `batch` operations at a time
    struct IndexSender {
        index: MemoryIndex,
    }

    #[async_trait::async_trait]
    impl MessageSender for IndexSender {
        async fn request(&self, _address: &str, message: Message) -> Result<Message> {
            match message {
                Message::OperationsSince {
                    shard,
                    from,
                    max_operations,
                    batch_size,
                } => match self.index.operations_since(from, max_operations, batch_size + 1).await {
                    Ok(mut operations) => {
                        let has_more = operations.len() > batch_size;
                        operations.truncate(batch_size);
                        Ok(Message::Operations {
                            shard,
                            operations,
                            has_more,
                        })
                    }
                    Err(e) => Ok(Message::error(&e)),
                },
                _ => Ok(Message::error(&Error::Internal("unsupported".into()))),
            }
        }
    }

    async fn transport(ops: usize) -> Arc<dyn ReplicaTransport> {
        let index = MemoryIndex::new(1000);
        for _ in 0..ops {
            index.append(OperationKind::Commit).await.unwrap();
        }
        Arc::new(MessageTransport::new(IndexSender { index }))
    }

    #[tokio::test]
    async fn test_stream_follows_batches() {
        let transport = transport(7).await;
        let limits = ReplayLimits {
            max_operations: 100,
            batch_size: 3,
        };

        let batches: Vec<Vec<Operation>> =
            stream_operations_since(transport, "leader".into(), ShardId::new("c", "s"), 1, limits)
                .map(|b| b.unwrap())
                .collect()
                .await;

        let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![3, 3]);
        let offsets: Vec<Offset> = batches.iter().flatten().map(|op| op.offset).collect();
        assert_eq!(offsets, vec![2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn test_error_reply_is_rejection() {
        let transport = transport(3).await;
        let limits = ReplayLimits {
            max_operations: 1,
            batch_size: 10,
        };
        let err = transport
            .fetch_operations("leader", &ShardId::new("c", "s"), 0, limits)
            .await
            .unwrap_err();
        match err {
            Error::Rejected { code, address, .. } => {
                assert_eq!(code, ErrorCode::RecoveryDataUnavailable);
                assert_eq!(address, "leader");
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
