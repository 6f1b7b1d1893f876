//! Update Forwarder
//!
//! Fans a leader's update out to every replica and reports one outcome per
//! replica. No replica is ever missing from the result.
//!
//! Each replica has its own delivery queue drained by one task, so updates
//! reach a replica in the order they were dispatched while a slow or
//! unreachable replica (waiting out its retry) holds up only its own queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::classifier::RetryPolicy;
use super::protocol::UpdateRequest;
use super::transport::ReplicaTransport;
use crate::error::Error;
use crate::state::{ReplicaId, ReplicaRecord};

/// Result of delivering one update to one replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateOutcome {
    /// Replica accepted the update
    Acked,
    /// Delivery abandoned while waiting to retry (shutdown or step-down)
    TransientFailure { error: String },
    /// Delivery failed permanently; the replica needs recovery
    Unreachable { error: String },
}

impl UpdateOutcome {
    pub fn is_acked(&self) -> bool {
        matches!(self, UpdateOutcome::Acked)
    }
}

/// One update waiting in a replica's queue
struct Delivery {
    request: Arc<UpdateRequest>,
    replica: ReplicaRecord,
    cancel: CancellationToken,
    reply: oneshot::Sender<UpdateOutcome>,
}

/// Outcomes of a dispatched update that are still being delivered
pub struct PendingOutcomes {
    replies: Vec<(ReplicaId, oneshot::Receiver<UpdateOutcome>)>,
}

impl PendingOutcomes {
    /// Wait for every replica's delivery to finish
    pub async fn outcomes(self) -> BTreeMap<ReplicaId, UpdateOutcome> {
        let waits = self.replies.into_iter().map(|(replica, reply)| async move {
            // A queue that went away never attempted the delivery
            let outcome = reply.await.unwrap_or_else(|_| UpdateOutcome::TransientFailure {
                error: Error::Cancelled.to_string(),
            });
            (replica, outcome)
        });
        join_all(waits).await.into_iter().collect()
    }
}

/// Forwards leader updates to replicas
pub struct UpdateForwarder {
    transport: Arc<dyn ReplicaTransport>,
    policy: RetryPolicy,
    queues: Mutex<HashMap<ReplicaId, mpsc::UnboundedSender<Delivery>>>,
}

impl UpdateForwarder {
    /// Create a forwarder
    pub fn new(transport: Arc<dyn ReplicaTransport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Retry policy in use
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Queue `request` for every replica without waiting for any of them.
    /// Updates dispatched one after another reach each replica in that order.
    pub fn forward(
        &self,
        request: UpdateRequest,
        replicas: &[ReplicaRecord],
        cancel: &CancellationToken,
    ) -> PendingOutcomes {
        let request = Arc::new(request);
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());

        let replies = replicas
            .iter()
            .map(|replica| {
                let (reply, outcome) = oneshot::channel();
                let delivery = Delivery {
                    request: Arc::clone(&request),
                    replica: replica.clone(),
                    cancel: cancel.clone(),
                    reply,
                };

                let rejected = match queues.get(&replica.id) {
                    Some(queue) => queue.send(delivery).err().map(|e| e.0),
                    None => Some(delivery),
                };
                if let Some(delivery) = rejected {
                    let queue = self.spawn_queue(&replica.id);
                    if queue.send(delivery).is_err() {
                        tracing::warn!("Update queue for {} closed on creation", replica.id);
                    }
                    queues.insert(replica.id.clone(), queue);
                }
                (replica.id.clone(), outcome)
            })
            .collect();

        PendingOutcomes { replies }
    }

    fn spawn_queue(&self, replica: &ReplicaId) -> mpsc::UnboundedSender<Delivery> {
        let (queue, mut deliveries) = mpsc::unbounded_channel::<Delivery>();
        let transport = Arc::clone(&self.transport);
        let policy = self.policy;
        let replica = replica.clone();

        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                let outcome = deliver(transport.as_ref(), &policy, &delivery).await;
                // The writer may have stopped waiting
                let _ = delivery.reply.send(outcome);
            }
            tracing::debug!("Update queue for {} closed", replica);
        });
        queue
    }
}

async fn deliver(transport: &dyn ReplicaTransport, policy: &RetryPolicy, delivery: &Delivery) -> UpdateOutcome {
    let request = delivery.request.as_ref();
    let replica = &delivery.replica;

    // Leadership ended while the update waited behind earlier ones
    if delivery.cancel.is_cancelled() {
        return UpdateOutcome::TransientFailure {
            error: Error::Cancelled.to_string(),
        };
    }

    let result = policy
        .run(&delivery.cancel, &replica.address, || {
            transport.send_update(&replica.address, request)
        })
        .await;

    match result {
        Ok(_) => UpdateOutcome::Acked,
        Err(failure) if failure.cancelled => UpdateOutcome::TransientFailure {
            error: failure.error.to_string(),
        },
        Err(failure) => {
            tracing::warn!(
                "Update {} to {} ({}) failed after {} attempt(s): {}",
                request.operation.offset,
                replica.id,
                replica.address,
                failure.attempts,
                failure.error
            );
            UpdateOutcome::Unreachable {
                error: failure.error.to_string(),
            }
        }
    }
}
