//! Shard Node
//!
//! One hosted copy of a shard. The node's [`Role`] is the single dispatch
//! point: every inbound message is matched together with the role, and the
//! leader-only and replica-only behaviour lives in the match arms.
//!
//! A [`NodeRuntime`] hosts several shard nodes behind one network server and
//! routes requests by shard id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::agent::ReplicaRecoveryAgent;
use super::classifier::RetryPolicy;
use super::coordinator::{LeaderInitiatedRecoveryCoordinator, MarkOutcome, ReplicaRecoveryStatus};
use super::forwarder::UpdateForwarder;
use super::protocol::{Message, ShardStatus, UpdateRequest, WriteReceipt};
use super::transport::ReplicaTransport;
use crate::config::{ElectionConfig, ForwardingConfig, RecoveryConfig, ShardSyncConfig};
use crate::error::{Error, Result};
use crate::index::{IndexEngine, MemoryIndex, Offset, OperationKind};
use crate::network::MessageHandler;
use crate::state::{
    LeaderRecord, ReplicaId, ReplicaState, ReplicaStateStore, Role, ShardId, ShardLeaderElector,
};

/// Tunables shared by every shard node of a process
#[derive(Debug, Clone, Default)]
pub struct NodeSettings {
    pub forwarding: ForwardingConfig,
    pub recovery: RecoveryConfig,
    pub election: ElectionConfig,
}

impl From<&ShardSyncConfig> for NodeSettings {
    fn from(config: &ShardSyncConfig) -> Self {
        Self {
            forwarding: config.forwarding.clone(),
            recovery: config.recovery.clone(),
            election: config.election.clone(),
        }
    }
}

/// One replica of one shard
pub struct ShardNode {
    shard: ShardId,
    replica: ReplicaId,
    address: String,
    role: RwLock<Role>,
    index: Arc<dyn IndexEngine>,
    store: ReplicaStateStore,
    elector: Arc<ShardLeaderElector>,
    transport: Arc<dyn ReplicaTransport>,
    forwarder: UpdateForwarder,
    coordinator: Arc<LeaderInitiatedRecoveryCoordinator>,
    agent: Arc<ReplicaRecoveryAgent>,
    /// Serializes appends and their hand-off to the replica queues, so
    /// offsets reach every replica in order
    write_lock: Mutex<()>,
    settings: NodeSettings,
    cancel: CancellationToken,
    /// Cancels the work of the current leadership tenure
    tenure: std::sync::Mutex<Option<CancellationToken>>,
}

impl ShardNode {
    /// Create a node; nothing runs until `start`
    pub fn new(
        shard: ShardId,
        replica: ReplicaId,
        address: String,
        store: ReplicaStateStore,
        index: Arc<dyn IndexEngine>,
        transport: Arc<dyn ReplicaTransport>,
        settings: NodeSettings,
    ) -> Self {
        let elector = Arc::new(ShardLeaderElector::new(store.clone(), settings.election.clone()));
        let coordinator = Arc::new(LeaderInitiatedRecoveryCoordinator::new(
            shard.clone(),
            replica.clone(),
            store.clone(),
            elector.clone(),
            settings.recovery.clone(),
        ));
        let agent = Arc::new(ReplicaRecoveryAgent::new(
            shard.clone(),
            replica.clone(),
            store.clone(),
            elector.clone(),
            index.clone(),
            transport.clone(),
            settings.recovery.clone(),
        ));
        let forwarder = UpdateForwarder::new(
            transport.clone(),
            RetryPolicy::from_config(&settings.forwarding),
        );

        Self {
            shard,
            replica,
            address,
            role: RwLock::new(Role::Replica { leader_generation: 0 }),
            index,
            store,
            elector,
            transport,
            forwarder,
            coordinator,
            agent,
            write_lock: Mutex::new(()),
            settings,
            cancel: CancellationToken::new(),
            tenure: std::sync::Mutex::new(None),
        }
    }

    pub fn shard(&self) -> &ShardId {
        &self.shard
    }

    pub fn replica(&self) -> &ReplicaId {
        &self.replica
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn role(&self) -> Role {
        self.role.read().await.clone()
    }

    pub fn index(&self) -> &Arc<dyn IndexEngine> {
        &self.index
    }

    pub fn agent(&self) -> &Arc<ReplicaRecoveryAgent> {
        &self.agent
    }

    pub fn coordinator(&self) -> &Arc<LeaderInitiatedRecoveryCoordinator> {
        &self.coordinator
    }

    pub fn elector(&self) -> &Arc<ShardLeaderElector> {
        &self.elector
    }

    /// Register with the store, publish DOWN and start the background loops
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.store
            .register_replica(&self.shard, &self.replica, &self.address)
            .await?;

        // The in-memory index did not survive a restart; a lease still held
        // from before must not keep serving as leader
        if let Some(leader) = self.elector.live_leader(&self.shard).await? {
            if leader.replica == self.replica {
                tracing::warn!(
                    "Replica {} still holds the lease of {} from before a restart; resigning",
                    self.replica,
                    self.shard
                );
                self.elector.resign(&self.shard, &self.replica, leader.generation).await?;
            }
        }

        self.agent.publish(None).await?;

        tokio::spawn(Arc::clone(&self.agent).run(self.cancel.child_token()));
        tokio::spawn(Arc::clone(self).lease_loop(self.cancel.child_token()));

        tracing::info!("Replica {} of {} started at {}", self.replica, self.shard, self.address);
        Ok(())
    }

    /// Stop the loops, give up leadership and publish DOWN
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        self.end_tenure();

        let role = {
            let mut role = self.role.write().await;
            let previous = role.clone();
            *role = Role::Replica {
                leader_generation: previous.generation(),
            };
            previous
        };
        if let Role::Leader { generation } = role {
            self.elector.resign(&self.shard, &self.replica, generation).await?;
        }

        self.agent.go_down().await;
        self.agent.publish(None).await?;
        tracing::info!("Replica {} of {} stopped", self.replica, self.shard);
        Ok(())
    }

    fn end_tenure(&self) {
        let token = self.tenure.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(token) = token {
            token.cancel();
        }
    }

    fn tenure_token(&self) -> CancellationToken {
        self.tenure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| self.cancel.child_token())
    }

    // ========== Leadership ==========

    async fn lease_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.election.lease_renew_interval());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.lease_tick(&cancel).await {
                        tracing::warn!("Lease check of {} on {} failed: {}", self.shard, self.replica, e);
                    }
                }
            }
        }
    }

    async fn lease_tick(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        let role = self.role().await;
        match role {
            Role::Leader { generation } => {
                if let Err(e) = self.elector.renew_lease(&self.shard, &self.replica, generation).await {
                    tracing::warn!(
                        "Replica {} lost the lease of {} (generation {}): {}",
                        self.replica,
                        self.shard,
                        generation,
                        e
                    );
                    self.step_down(generation).await;
                }
            }
            Role::Replica { leader_generation } => match self.elector.live_leader(&self.shard).await? {
                Some(leader) if leader.replica == self.replica => {
                    // Won an election whose outcome was not applied locally
                    self.elector.resign(&self.shard, &self.replica, leader.generation).await?;
                }
                Some(leader) => {
                    if leader.generation != leader_generation {
                        *self.role.write().await = Role::Replica {
                            leader_generation: leader.generation,
                        };
                        self.agent.follow(&leader).await;
                    }
                    if self.agent.begin_startup().await {
                        tracing::info!(
                            "Replica {} of {} catching up from {} at startup",
                            self.replica,
                            self.shard,
                            leader.replica
                        );
                        self.agent.spawn_startup();
                    }
                }
                None => {
                    if self.eligible().await? {
                        self.stand_for_election(cancel).await?;
                    }
                }
            },
        }
        Ok(())
    }

    /// A replica may stand if it is ACTIVE, or if no copy of the shard is
    /// (first start or whole-shard restart)
    async fn eligible(&self) -> Result<bool> {
        if self.agent.state().await == ReplicaState::Active {
            return Ok(true);
        }
        let replicas = self.store.replicas(&self.shard).await?;
        Ok(!replicas.iter().any(|r| r.state == ReplicaState::Active))
    }

    async fn stand_for_election(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        let delay = self.elector.election_delay();
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }

        if let Some(record) = self
            .elector
            .try_become_leader(&self.shard, &self.replica, &self.address)
            .await?
        {
            self.become_leader(record).await?;
        }
        Ok(())
    }

    async fn become_leader(self: &Arc<Self>, record: LeaderRecord) -> Result<()> {
        let generation = record.generation;
        {
            let _serial = self.write_lock.lock().await;
            self.agent.lead(generation).await;
            *self.role.write().await = Role::Leader { generation };
        }
        tracing::info!(
            "Replica {} became leader of {} (generation {}, offset {})",
            self.replica,
            self.shard,
            generation,
            self.index.last_offset().await
        );

        self.agent.publish(None).await?;
        let removed = self.coordinator.invalidate_stale_markers(generation).await?;
        if removed > 0 {
            tracing::info!("Invalidated {} recovery marker(s) of {} from older generations", removed, self.shard);
        }

        self.end_tenure();
        let token = self.cancel.child_token();
        *self.tenure.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());
        tokio::spawn(Arc::clone(&self.coordinator).run(token));
        Ok(())
    }

    async fn step_down(&self, generation: u64) {
        {
            let mut role = self.role.write().await;
            if *role != (Role::Leader { generation }) {
                return;
            }
            *role = Role::Replica {
                leader_generation: generation,
            };
        }
        self.end_tenure();
        tracing::warn!("Replica {} stepped down as leader of {} (generation {})", self.replica, self.shard, generation);
        self.agent.step_down().await;
    }

    /// Whether this node still holds a live lease at `generation`
    async fn holds_lease(&self, generation: u64) -> Result<bool> {
        Ok(self
            .elector
            .live_leader(&self.shard)
            .await?
            .is_some_and(|l| l.replica == self.replica && l.generation == generation))
    }

    async fn not_leader(&self) -> Error {
        let leader = match self.elector.live_leader(&self.shard).await {
            Ok(Some(leader)) => leader.replica.to_string(),
            _ => "unknown".to_string(),
        };
        Error::NotLeader {
            shard: self.shard.to_string(),
            leader,
        }
    }

    // ========== Dispatch ==========

    /// Answer one request addressed to this shard
    pub async fn handle(&self, message: Message) -> Message {
        if self.cancel.is_cancelled() {
            return Message::error(&Error::ShuttingDown);
        }
        let role = self.role().await;

        let result = match (role, message) {
            (_, Message::ClientWrite { kind, .. }) => self
                .write(kind)
                .await
                .map(|receipt| Message::WriteResponse { receipt }),

            (Role::Leader { generation }, Message::Update(request)) => {
                self.superseded_update(generation, request).await
            }
            (Role::Replica { .. }, Message::Update(request)) => self.accept_update(request).await,

            (
                Role::Leader { .. },
                Message::OperationsSince {
                    from,
                    max_operations,
                    batch_size,
                    ..
                },
            ) => self.serve_operations(from, max_operations, batch_size).await,
            (Role::Leader { .. }, Message::SnapshotRequest { .. }) => self.serve_snapshot().await,
            (Role::Replica { .. }, Message::OperationsSince { .. } | Message::SnapshotRequest { .. }) => {
                Err(self.not_leader().await)
            }

            (_, Message::StatusRequest) => Ok(Message::StatusResponse {
                node_id: self.replica.to_string(),
                shards: vec![self.status().await],
            }),

            (_, other) => Err(Error::Internal(format!("unexpected {} for {}", other.type_name(), self.shard))),
        };

        result.unwrap_or_else(|e| Message::error(&e))
    }

    async fn accept_update(&self, request: UpdateRequest) -> Result<Message> {
        let offset = self.agent.accept_update(&request).await?;
        Ok(Message::UpdateAck {
            shard: self.shard.clone(),
            replica: self.replica.clone(),
            offset,
        })
    }

    /// An update reached a node that believes it leads: either the sender
    /// is stale or this node lost its lease without noticing yet
    async fn superseded_update(&self, generation: u64, request: UpdateRequest) -> Result<Message> {
        if request.generation <= generation || self.holds_lease(generation).await? {
            return Err(Error::StaleLeader {
                shard: self.shard.to_string(),
                generation: request.generation,
                current: generation,
            });
        }
        self.step_down(generation).await;
        self.accept_update(request).await
    }

    async fn serve_operations(&self, from: Offset, max_operations: u64, batch_size: usize) -> Result<Message> {
        let batch_size = batch_size.max(1);
        let mut operations = self.index.operations_since(from, max_operations, batch_size + 1).await?;
        let has_more = operations.len() > batch_size;
        operations.truncate(batch_size);
        Ok(Message::Operations {
            shard: self.shard.clone(),
            operations,
            has_more,
        })
    }

    async fn serve_snapshot(&self) -> Result<Message> {
        let snapshot = self.index.snapshot().await?;
        tracing::info!(
            "Serving snapshot of {} at offset {} ({} documents)",
            self.shard,
            snapshot.offset,
            snapshot.documents.len()
        );
        Ok(Message::SnapshotResponse {
            shard: self.shard.clone(),
            offset: snapshot.offset,
            data: snapshot.encode()?,
        })
    }

    // ========== Writes ==========

    /// Accept a client write: lead it, or forward it to the leader
    pub async fn write(&self, kind: OperationKind) -> Result<WriteReceipt> {
        match self.role().await {
            Role::Leader { .. } => self.lead_write(kind).await,
            Role::Replica { .. } => self.forward_to_leader(kind).await,
        }
    }

    async fn lead_write(&self, kind: OperationKind) -> Result<WriteReceipt> {
        let serial = self.write_lock.lock().await;
        let Role::Leader { generation } = self.role().await else {
            drop(serial);
            return self.forward_to_leader(kind).await;
        };

        let operation = self.index.append(kind).await?;
        let offset = operation.offset;
        tracing::debug!("Leader of {} appended {} at offset {}", self.shard, operation.kind.name(), offset);

        let replicas: Vec<_> = match self.store.replicas(&self.shard).await {
            Ok(replicas) => replicas.into_iter().filter(|r| r.id != self.replica).collect(),
            Err(e) => {
                // The next write will find the replicas out of sequence
                tracing::warn!("Could not list replicas of {}; offset {} not forwarded: {}", self.shard, offset, e);
                Vec::new()
            }
        };

        let request = UpdateRequest {
            shard: self.shard.clone(),
            leader: self.replica.clone(),
            generation,
            operation,
        };
        let pending = self.forwarder.forward(request, &replicas, &self.tenure_token());
        drop(serial);

        // Only this write waits for its slowest replica
        let outcomes = pending.outcomes().await;
        self.coordinator.handle_outcomes(&outcomes).await;

        Ok(WriteReceipt {
            shard: self.shard.clone(),
            offset,
            leader: self.replica.clone(),
            generation,
            outcomes,
        })
    }

    async fn forward_to_leader(&self, kind: OperationKind) -> Result<WriteReceipt> {
        let target = format!("leader of {}", self.shard);
        self.forwarder
            .policy()
            .run(&self.cancel, &target, || {
                let kind = kind.clone();
                async move {
                    let leader = self.elector.current_leader(&self.shard).await?;
                    if leader.replica == self.replica {
                        return Err(Error::NotLeader {
                            shard: self.shard.to_string(),
                            leader: "pending".to_string(),
                        });
                    }
                    tracing::debug!("Forwarding {} on {} to leader {}", kind.name(), self.shard, leader.replica);
                    self.transport.forward_write(&leader.address, &self.shard, kind).await
                }
            })
            .await
            .map_err(|failure| failure.error)
    }

    // ========== Operator actions ==========

    /// Status of this copy
    pub async fn status(&self) -> ShardStatus {
        let role = self.role().await;
        ShardStatus {
            shard: self.shard.clone(),
            replica: self.replica.clone(),
            is_leader: role.is_leader(),
            generation: role.generation(),
            state: self.agent.state().await,
            last_offset: self.index.last_offset().await,
            committed_offset: self.index.committed_offset().await,
            documents: self.index.document_count().await,
        }
    }

    /// Recovery phase of every replica of the shard
    pub async fn recovery_status(&self) -> Result<Vec<ReplicaRecoveryStatus>> {
        self.coordinator.recovery_status().await
    }

    /// Ask the leader's coordinator to retry a replica's recovery
    pub async fn retry_recovery(&self, replica: &ReplicaId) -> Result<MarkOutcome> {
        match self.role().await {
            Role::Leader { .. } => self.coordinator.retry_recovery(replica).await,
            Role::Replica { .. } => Err(self.not_leader().await),
        }
    }
}

/// Shard nodes hosted by one process
pub struct NodeRuntime {
    node_id: String,
    shards: HashMap<ShardId, Arc<ShardNode>>,
}

impl NodeRuntime {
    /// Host the given shard nodes
    pub fn new(node_id: impl Into<String>, nodes: Vec<Arc<ShardNode>>) -> Self {
        Self {
            node_id: node_id.into(),
            shards: nodes.into_iter().map(|n| (n.shard().clone(), n)).collect(),
        }
    }

    /// Build one node per configured shard, each over a fresh in-memory index
    pub fn from_config(
        config: &ShardSyncConfig,
        store: ReplicaStateStore,
        transport: Arc<dyn ReplicaTransport>,
    ) -> Self {
        let settings = NodeSettings::from(config);
        let nodes = config
            .shard_ids()
            .into_iter()
            .map(|shard| {
                Arc::new(ShardNode::new(
                    shard,
                    ReplicaId::new(&config.node.id),
                    config.advertise_address().to_string(),
                    store.clone(),
                    Arc::new(MemoryIndex::new(settings.recovery.history_retention)),
                    transport.clone(),
                    settings.clone(),
                ))
            })
            .collect();
        Self::new(&config.node.id, nodes)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Node hosting `shard`
    pub fn shard(&self, shard: &ShardId) -> Result<&Arc<ShardNode>> {
        self.shards
            .get(shard)
            .ok_or_else(|| Error::ShardNotFound(shard.to_string()))
    }

    /// Hosted nodes ordered by shard id
    pub fn nodes(&self) -> Vec<&Arc<ShardNode>> {
        let mut nodes: Vec<_> = self.shards.values().collect();
        nodes.sort_by(|a, b| a.shard().cmp(b.shard()));
        nodes
    }

    pub async fn start(&self) -> Result<()> {
        for node in self.nodes() {
            node.start().await?;
        }
        Ok(())
    }

    /// Stop every node, reporting the first failure
    pub async fn stop(&self) -> Result<()> {
        let mut first_error = None;
        for node in self.nodes() {
            if let Err(e) = node.stop().await {
                tracing::error!("Failed to stop {}: {}", node.shard(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Status of every hosted shard
    pub async fn status(&self) -> Vec<ShardStatus> {
        let mut shards = Vec::with_capacity(self.shards.len());
        for node in self.nodes() {
            shards.push(node.status().await);
        }
        shards
    }
}

#[async_trait::async_trait]
impl MessageHandler for NodeRuntime {
    async fn handle(&self, peer: &str, message: Message) -> Message {
        if let Message::StatusRequest = message {
            return Message::StatusResponse {
                node_id: self.node_id.clone(),
                shards: self.status().await,
            };
        }

        let Some(shard) = message.shard().cloned() else {
            tracing::debug!("Unroutable {} from {}", message.type_name(), peer);
            return Message::error(&Error::Internal(format!("{} carries no shard", message.type_name())));
        };
        match self.shard(&shard) {
            Ok(node) => node.handle(message).await,
            Err(e) => Message::error(&e),
        }
    }
}
