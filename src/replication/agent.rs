//! Replica Recovery Agent
//!
//! Runs on every replica of a shard. It holds the replica's local lifecycle
//! state, decides whether an incoming update may be applied, and performs
//! catch-up against the leader: when a recovery marker addressed to this
//! replica appears, at startup, and when a new leader generation is seen.
//!
//! Within one leader generation offsets are a single sequence, so a replica
//! that followed the same generation catches up by replaying what it missed.
//! After a generation change its tail may differ from the new leader's, so
//! it installs a snapshot instead.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::protocol::{ErrorCode, UpdateRequest};
use super::transport::{stream_operations_since, ReplayLimits, ReplicaTransport};
use crate::config::RecoveryConfig;
use crate::error::{Error, Result};
use crate::index::{IndexEngine, Offset, Operation};
use crate::state::{
    LeaderRecord, MarkerReason, RecoveryMarker, ReplicaId, ReplicaState, ReplicaStateStore,
    ShardId, ShardLeaderElector, StatePublication,
};

struct LocalState {
    state: ReplicaState,
    /// Set while this replica holds the leader lease
    leading: bool,
    /// Generation of the leader whose updates are accepted
    leader_generation: u64,
    /// Generation whose offset sequence the index follows
    synced_generation: u64,
    /// Updates received while recovering, drained after catch-up
    buffer: BTreeMap<Offset, Operation>,
    /// A catch-up is scheduled or running
    in_flight: bool,
    /// Marker the running catch-up reports under
    recovery_ref: Option<Uuid>,
}

impl LocalState {
    /// End the running catch-up, returning the marker it reports under
    fn settle(&mut self) -> Option<Uuid> {
        self.in_flight = false;
        self.recovery_ref.take()
    }
}

/// What happened to an observed marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerAction {
    /// Recovery ran (and published ACTIVE or RECOVERY_FAILED)
    Executed,
    /// Marker from an older leader generation; deleted without recovering
    Discarded,
    /// Not actionable yet; looked at again on the next change
    Deferred,
    /// Joined the catch-up already running, which reports under the marker
    Joined,
    /// Replica was already caught up with this generation; ACTIVE published
    /// under the marker without another catch-up
    Acknowledged,
}

fn is_unavailable(error: &Error) -> bool {
    matches!(
        error,
        Error::RecoveryDataUnavailable { .. }
            | Error::Rejected {
                code: ErrorCode::RecoveryDataUnavailable,
                ..
            }
    )
}

/// Recovery agent of one replica
pub struct ReplicaRecoveryAgent {
    shard: ShardId,
    replica: ReplicaId,
    store: ReplicaStateStore,
    elector: Arc<ShardLeaderElector>,
    index: Arc<dyn IndexEngine>,
    transport: Arc<dyn ReplicaTransport>,
    config: RecoveryConfig,
    local: Mutex<LocalState>,
    /// Serializes catch-up runs
    recovery: Mutex<()>,
}

impl ReplicaRecoveryAgent {
    /// Create an agent for one replica; it starts DOWN
    pub fn new(
        shard: ShardId,
        replica: ReplicaId,
        store: ReplicaStateStore,
        elector: Arc<ShardLeaderElector>,
        index: Arc<dyn IndexEngine>,
        transport: Arc<dyn ReplicaTransport>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            shard,
            replica,
            store,
            elector,
            index,
            transport,
            config,
            local: Mutex::new(LocalState {
                state: ReplicaState::Down,
                leading: false,
                leader_generation: 0,
                synced_generation: 0,
                buffer: BTreeMap::new(),
                in_flight: false,
                recovery_ref: None,
            }),
            recovery: Mutex::new(()),
        }
    }

    /// Local lifecycle state
    pub async fn state(&self) -> ReplicaState {
        self.local.lock().await.state
    }

    /// Publish the local state to the store
    pub async fn publish(&self, recovery_ref: Option<Uuid>) -> Result<()> {
        let (state, generation) = {
            let local = self.local.lock().await;
            (local.state, local.leader_generation)
        };
        self.publish_as(state, generation, recovery_ref).await
    }

    async fn publish_as(&self, state: ReplicaState, generation: u64, recovery_ref: Option<Uuid>) -> Result<()> {
        self.store
            .publish_state(&self.shard, &self.replica, StatePublication {
                state,
                generation,
                last_offset: self.index.last_offset().await,
                recovery_ref,
            })
            .await
            .map(|_| ())
    }

    /// This replica now leads `generation`; its index defines the sequence
    pub async fn lead(&self, generation: u64) {
        let mut local = self.local.lock().await;
        local.state = ReplicaState::Active;
        local.leading = true;
        local.leader_generation = generation;
        local.synced_generation = generation;
        local.buffer.clear();
    }

    /// This replica stopped leading. Its tail may not exist on the next
    /// leader, so it resyncs by snapshot before accepting updates again.
    pub async fn step_down(self: &Arc<Self>) {
        {
            let mut local = self.local.lock().await;
            local.state = ReplicaState::Recovering;
            local.leading = false;
            local.synced_generation = 0;
            local.buffer.clear();
            local.in_flight = true;
        }
        self.spawn_resync();
    }

    /// Move a DOWN replica to RECOVERING for its startup catch-up.
    /// True if it was DOWN; the caller then runs `recover`.
    pub async fn begin_startup(&self) -> bool {
        let mut local = self.local.lock().await;
        if local.state != ReplicaState::Down || local.leading {
            return false;
        }
        local.state = ReplicaState::Recovering;
        local.in_flight = true;
        true
    }

    /// Startup catch-up in the background
    pub fn spawn_startup(self: &Arc<Self>) {
        self.spawn_resync();
    }

    /// Mark the replica DOWN (shutdown)
    pub async fn go_down(&self) {
        let mut local = self.local.lock().await;
        local.state = ReplicaState::Down;
        local.leading = false;
        local.buffer.clear();
    }

    /// Adopt a newer leader generation; true if an ACTIVE replica must resync.
    /// DOWN and RECOVERY_FAILED replicas wait for startup or a marker.
    fn adopt(local: &mut LocalState, generation: u64) -> bool {
        if generation <= local.leader_generation {
            return false;
        }
        local.leader_generation = generation;
        local.buffer.clear();
        if local.state == ReplicaState::Active && local.synced_generation != generation {
            local.state = ReplicaState::Recovering;
            local.in_flight = true;
            return true;
        }
        false
    }

    /// Follow a leader observed in the store, resyncing if its generation is new
    pub async fn follow(self: &Arc<Self>, leader: &LeaderRecord) {
        let resync = {
            let mut local = self.local.lock().await;
            Self::adopt(&mut local, leader.generation)
        };
        if resync {
            tracing::info!(
                "Replica {} of {} following {} at generation {}; resyncing",
                self.replica,
                self.shard,
                leader.replica,
                leader.generation
            );
            self.spawn_resync();
        }
    }

    fn spawn_resync(self: &Arc<Self>) {
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = agent.recover(None).await {
                tracing::warn!("Resync of {} on {} failed: {}", agent.replica, agent.shard, e);
            }
        });
    }

    /// Decide on an update from the leader. Returns the offset acknowledged.
    pub async fn accept_update(self: &Arc<Self>, request: &UpdateRequest) -> Result<Offset> {
        let mut local = self.local.lock().await;

        if request.generation < local.leader_generation {
            return Err(Error::StaleLeader {
                shard: self.shard.to_string(),
                generation: request.generation,
                current: local.leader_generation,
            });
        }

        if request.generation > local.leader_generation {
            // Revalidate against the store before trusting a new generation
            let leader = self.store.leader(&self.shard).await?.map(|v| v.value);
            match leader {
                Some(l) if l.generation == request.generation && l.replica == request.leader => {
                    if Self::adopt(&mut local, l.generation) {
                        tracing::info!(
                            "Replica {} of {} saw generation {} from {}; resyncing",
                            self.replica,
                            self.shard,
                            l.generation,
                            l.replica
                        );
                        self.spawn_resync();
                    }
                }
                Some(l) if l.generation > request.generation => {
                    return Err(Error::StaleLeader {
                        shard: self.shard.to_string(),
                        generation: request.generation,
                        current: l.generation,
                    });
                }
                _ => return Err(Error::NoLeader(self.shard.to_string())),
            }
        }

        let operation = &request.operation;
        match local.state {
            ReplicaState::Active => {
                self.index.apply(operation).await?;
                Ok(operation.offset)
            }
            ReplicaState::Recovering => {
                local.buffer.insert(operation.offset, operation.clone());
                Ok(operation.offset)
            }
            ReplicaState::Down | ReplicaState::RecoveryFailed => Err(Error::ReplicaUnavailable {
                replica: self.replica.to_string(),
                state: local.state.to_string(),
            }),
        }
    }

    /// Watch for recovery markers addressed to this replica until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.store.watch_marker(&self.shard, &self.replica);
        let mut ticker = tokio::time::interval(self.config.check_interval());
        let mut handled: Option<Uuid> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(_) = events.next() => self.check_marker(&mut handled).await,
                _ = ticker.tick() => self.check_marker(&mut handled).await,
            }
        }
    }

    async fn check_marker(&self, handled: &mut Option<Uuid>) {
        let marker = match self.store.marker(&self.shard, &self.replica).await {
            Ok(Some(v)) => v.value,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Failed to read recovery marker of {}: {}", self.replica, e);
                return;
            }
        };
        if *handled == Some(marker.id) {
            return;
        }

        match self.handle_marker(&marker).await {
            Ok(MarkerAction::Deferred) => {}
            Ok(_) => *handled = Some(marker.id),
            Err(e) => tracing::warn!(
                "Recovery marker {} for {} of {} not handled: {}",
                marker.id,
                self.replica,
                self.shard,
                e
            ),
        }
    }

    /// Validate a marker against the current leader and run the recovery it asks for
    pub async fn handle_marker(&self, marker: &RecoveryMarker) -> Result<MarkerAction> {
        let leader = self.elector.current_leader(&self.shard).await?;

        if marker.leader_generation < leader.generation {
            let stale = Error::StaleAuthority {
                shard: self.shard.to_string(),
                marker_generation: marker.leader_generation,
                leader_generation: leader.generation,
            };
            tracing::warn!("Discarding recovery marker {} for {}: {}", marker.id, self.replica, stale);
            self.store
                .clear_marker(&self.shard, &self.replica, marker.id, marker.leader_generation)
                .await?;
            return Ok(MarkerAction::Discarded);
        }
        if marker.leader_generation > leader.generation {
            return Ok(MarkerAction::Deferred);
        }
        if leader.replica == self.replica {
            tracing::warn!("Ignoring recovery marker {} addressed to the leader {}", marker.id, self.replica);
            return Ok(MarkerAction::Discarded);
        }
        if let Some(action) = self.covered(marker, &leader).await? {
            return Ok(action);
        }

        tracing::info!(
            "Replica {} of {} starting recovery for marker {} (attempt {}, reason: {})",
            self.replica,
            self.shard,
            marker.id,
            marker.attempt,
            marker.reason
        );
        if let Err(e) = self.recover(Some(marker.id)).await {
            tracing::warn!("Recovery for marker {} ended in failure: {}", marker.id, e);
        }
        Ok(MarkerAction::Executed)
    }

    /// Whether catch-up work this replica already does covers the marker
    async fn covered(&self, marker: &RecoveryMarker, leader: &LeaderRecord) -> Result<Option<MarkerAction>> {
        let caught_up = {
            let mut local = self.local.lock().await;
            if local.in_flight {
                local.recovery_ref = Some(marker.id);
                tracing::info!(
                    "Recovery marker {} for {} of {} joins the catch-up already running",
                    marker.id,
                    self.replica,
                    self.shard
                );
                return Ok(Some(MarkerAction::Joined));
            }
            matches!(marker.reason, MarkerReason::ReplicaReported { .. })
                && local.state == ReplicaState::Active
                && local.synced_generation == leader.generation
        };
        if !caught_up {
            return Ok(None);
        }

        self.publish_as(ReplicaState::Active, leader.generation, Some(marker.id)).await?;
        tracing::info!(
            "Replica {} of {} already follows generation {}; acknowledged marker {}",
            self.replica,
            self.shard,
            leader.generation,
            marker.id
        );
        Ok(Some(MarkerAction::Acknowledged))
    }

    /// Marker the running catch-up reports under
    async fn recovery_ref(&self) -> Option<Uuid> {
        self.local.lock().await.recovery_ref
    }

    /// Catch up with the current leader and become ACTIVE. Publishes
    /// RECOVERING first and RECOVERY_FAILED if every attempt fails.
    pub async fn recover(&self, recovery_ref: Option<Uuid>) -> Result<()> {
        let _serial = self.recovery.lock().await;
        {
            let mut local = self.local.lock().await;
            if local.leading {
                local.settle();
                return Ok(());
            }
            local.state = ReplicaState::Recovering;
            local.in_flight = true;
            if recovery_ref.is_some() {
                local.recovery_ref = recovery_ref;
            }
        }

        let result = self.catch_up_with_retries().await;
        if result.is_err() {
            self.local.lock().await.settle();
        }
        result
    }

    async fn catch_up_with_retries(&self) -> Result<()> {
        let attempts = self.config.catch_up_attempts.max(1);
        let mut last_error = Error::NoLeader(self.shard.to_string());

        for attempt in 1..=attempts {
            match self.catch_up_attempt().await {
                Ok(Some(leader)) => {
                    let recovery_ref = self.local.lock().await.settle();
                    self.publish_as(ReplicaState::Active, leader.generation, recovery_ref).await?;
                    tracing::info!(
                        "Replica {} of {} is ACTIVE at offset {} (generation {})",
                        self.replica,
                        self.shard,
                        self.index.last_offset().await,
                        leader.generation
                    );
                    return Ok(());
                }
                Ok(None) => {
                    self.local.lock().await.settle();
                    tracing::info!("Replica {} of {} now leads; catch-up skipped", self.replica, self.shard);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        "Catch-up of {} on {} failed (attempt {}/{}): {}",
                        self.replica,
                        self.shard,
                        attempt,
                        attempts,
                        e
                    );
                    last_error = e;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.catch_up_backoff()).await;
            }
        }

        let (generation, recovery_ref) = {
            let mut local = self.local.lock().await;
            let recovery_ref = local.settle();
            if local.leading {
                return Ok(());
            }
            local.state = ReplicaState::RecoveryFailed;
            local.buffer.clear();
            (local.leader_generation, recovery_ref)
        };
        self.publish_as(ReplicaState::RecoveryFailed, generation, recovery_ref).await?;
        tracing::error!("Replica {} of {} is RECOVERY_FAILED: {}", self.replica, self.shard, last_error);

        Err(Error::RecoveryFailed {
            replica: self.replica.to_string(),
            reason: last_error.to_string(),
        })
    }

    /// One catch-up round against the current leader. Returns the leader
    /// caught up with, or None if this replica leads.
    async fn catch_up_attempt(&self) -> Result<Option<LeaderRecord>> {
        let leader = self.elector.current_leader(&self.shard).await?;
        if leader.replica == self.replica {
            return Ok(None);
        }

        {
            let mut local = self.local.lock().await;
            local.leader_generation = local.leader_generation.max(leader.generation);
        }
        self.publish_as(ReplicaState::Recovering, leader.generation, self.recovery_ref().await)
            .await?;

        self.catch_up(&leader).await?;

        if self.finish(&leader).await? {
            Ok(Some(leader))
        } else {
            Err(Error::Internal(format!(
                "updates from {} arrived out of order during catch-up",
                leader.replica
            )))
        }
    }

    /// Bring the index up to the leader's offset by replay or snapshot
    async fn catch_up(&self, leader: &LeaderRecord) -> Result<Offset> {
        let from = self.index.last_offset().await;
        let synced = self.local.lock().await.synced_generation;

        if from == 0 || synced == leader.generation {
            match self.replay(leader, from).await {
                Ok(offset) => {
                    self.local.lock().await.synced_generation = leader.generation;
                    return Ok(offset);
                }
                Err(e) if is_unavailable(&e) => {
                    tracing::info!(
                        "Replay from offset {} unavailable on {} ({}); installing snapshot",
                        from,
                        leader.replica,
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        } else {
            tracing::info!(
                "Replica {} of {} follows generation {} but leader is at {}; installing snapshot",
                self.replica,
                self.shard,
                synced,
                leader.generation
            );
        }

        let snapshot = self.transport.fetch_snapshot(&leader.address, &self.shard).await?;
        let offset = snapshot.offset;
        self.index.install_snapshot(snapshot).await?;
        self.local.lock().await.synced_generation = leader.generation;
        tracing::info!(
            "Replica {} of {} installed snapshot at offset {} from {}",
            self.replica,
            self.shard,
            offset,
            leader.replica
        );
        Ok(offset)
    }

    async fn replay(&self, leader: &LeaderRecord, from: Offset) -> Result<Offset> {
        let limits = ReplayLimits {
            max_operations: self.config.max_replay_operations,
            batch_size: self.config.replay_batch_size.max(1),
        };
        let mut batches = stream_operations_since(
            Arc::clone(&self.transport),
            leader.address.clone(),
            self.shard.clone(),
            from,
            limits,
        );

        let mut replayed = 0usize;
        while let Some(batch) = batches.next().await {
            let batch = batch?;
            for operation in &batch {
                self.index.apply(operation).await?;
            }
            replayed += batch.len();

            // Progress is visible to the leader's timeout check
            if let Err(e) = self
                .publish_as(ReplicaState::Recovering, leader.generation, self.recovery_ref().await)
                .await
            {
                tracing::debug!("Progress publication failed: {}", e);
            }
        }

        let offset = self.index.last_offset().await;
        tracing::info!(
            "Replica {} of {} replayed {} operation(s) from {}; now at offset {}",
            self.replica,
            self.shard,
            replayed,
            leader.replica,
            offset
        );
        Ok(offset)
    }

    /// Drain buffered updates and switch to ACTIVE. False if the leader
    /// moved or the buffer does not continue the index.
    async fn finish(&self, leader: &LeaderRecord) -> Result<bool> {
        let mut local = self.local.lock().await;
        if local.leader_generation != leader.generation || local.leading {
            return Ok(false);
        }

        while let Some((_, operation)) = local.buffer.pop_first() {
            match self.index.apply(&operation).await {
                Ok(_) => {}
                Err(Error::OutOfSequence { expected, got }) => {
                    local.buffer.insert(operation.offset, operation);
                    tracing::debug!(
                        "Buffered update {} does not follow offset {}; catching up again",
                        got,
                        expected - 1
                    );
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }

        local.state = ReplicaState::Active;
        local.synced_generation = leader.generation;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ElectionConfig;
    use crate::index::{MemoryIndex, OperationKind, Snapshot};
    use crate::replication::protocol::WriteReceipt;
    use crate::replication::transport::OperationBatch;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves catch-up straight from the leader's index
    struct LeaderLink {
        index: Arc<MemoryIndex>,
        snapshots: AtomicUsize,
        replays: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ReplicaTransport for LeaderLink {
        async fn send_update(&self, _: &str, _: &UpdateRequest) -> Result<Offset> {
            unimplemented!()
        }

        async fn fetch_operations(
            &self,
            _: &str,
            _: &ShardId,
            from: Offset,
            limits: ReplayLimits,
        ) -> Result<OperationBatch> {
            self.replays.fetch_add(1, Ordering::SeqCst);
            let mut operations = self
                .index
                .operations_since(from, limits.max_operations, limits.batch_size + 1)
                .await?;
            let has_more = operations.len() > limits.batch_size;
            operations.truncate(limits.batch_size);
            Ok(OperationBatch { operations, has_more })
        }

        async fn fetch_snapshot(&self, _: &str, _: &ShardId) -> Result<Snapshot> {
            self.snapshots.fetch_add(1, Ordering::SeqCst);
            self.index.snapshot().await
        }

        async fn forward_write(&self, _: &str, _: &ShardId, _: OperationKind) -> Result<WriteReceipt> {
            unimplemented!()
        }
    }

    struct Fixture {
        store: ReplicaStateStore,
        elector: Arc<ShardLeaderElector>,
        leader_index: Arc<MemoryIndex>,
        link: Arc<LeaderLink>,
        agent: Arc<ReplicaRecoveryAgent>,
        shard: ShardId,
        leader: LeaderRecord,
    }

    async fn fixture(retention: usize) -> Fixture {
        let store = ReplicaStateStore::new(Arc::new(MemoryStore::new()));
        let elector = Arc::new(ShardLeaderElector::new(
            store.clone(),
            ElectionConfig {
                leader_retry_attempts: 2,
                leader_retry_backoff_ms: 5,
                ..ElectionConfig::default()
            },
        ));
        let shard = ShardId::new("collection1", "shard1");
        store.register_replica(&shard, &"leader".into(), "leader:1").await.unwrap();
        store.register_replica(&shard, &"r2".into(), "r2:1").await.unwrap();
        let leader = elector
            .try_become_leader(&shard, &"leader".into(), "leader:1")
            .await
            .unwrap()
            .unwrap();

        let leader_index = Arc::new(MemoryIndex::new(retention));
        let link = Arc::new(LeaderLink {
            index: leader_index.clone(),
            snapshots: AtomicUsize::new(0),
            replays: AtomicUsize::new(0),
        });
        let config = RecoveryConfig {
            catch_up_attempts: 2,
            catch_up_backoff_ms: 5,
            replay_batch_size: 2,
            check_interval_ms: 20,
            ..RecoveryConfig::default()
        };
        let agent = Arc::new(ReplicaRecoveryAgent::new(
            shard.clone(),
            "r2".into(),
            store.clone(),
            elector.clone(),
            Arc::new(MemoryIndex::new(retention)),
            link.clone(),
            config,
        ));
        Fixture {
            store,
            elector,
            leader_index,
            link,
            agent,
            shard,
            leader,
        }
    }

    async fn write(f: &Fixture, n: usize) -> Vec<Operation> {
        let mut ops = Vec::new();
        for _ in 0..n {
            ops.push(f.leader_index.append(OperationKind::Commit).await.unwrap());
        }
        ops
    }

    fn update(f: &Fixture, operation: Operation) -> UpdateRequest {
        UpdateRequest {
            shard: f.shard.clone(),
            leader: f.leader.replica.clone(),
            generation: f.leader.generation,
            operation,
        }
    }

    async fn record_state(f: &Fixture) -> (ReplicaState, Option<Uuid>) {
        let record = f.store.replica(&f.shard, &"r2".into()).await.unwrap().unwrap().value;
        (record.state, record.recovery_ref)
    }

    #[tokio::test]
    async fn test_startup_catch_up_by_replay() {
        let f = fixture(100).await;
        write(&f, 5).await;

        f.agent.recover(None).await.unwrap();
        assert_eq!(f.agent.state().await, ReplicaState::Active);
        assert_eq!(f.agent.index.last_offset().await, 5);
        assert_eq!(f.link.snapshots.load(Ordering::SeqCst), 0);
        assert_eq!(record_state(&f).await, (ReplicaState::Active, None));
    }

    #[tokio::test]
    async fn test_falls_back_to_snapshot() {
        let f = fixture(2).await;
        write(&f, 6).await;

        f.agent.recover(None).await.unwrap();
        assert_eq!(f.agent.index.last_offset().await, 6);
        assert_eq!(f.link.snapshots.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_update_acceptance_by_state() {
        let f = fixture(100).await;
        let ops = write(&f, 3).await;

        // DOWN rejects
        let err = f.agent.accept_update(&update(&f, ops[0].clone())).await.unwrap_err();
        assert!(matches!(err, Error::ReplicaUnavailable { .. }));

        f.agent.recover(None).await.unwrap();
        let next = write(&f, 2).await;

        // ACTIVE applies in sequence; duplicates acked, gaps rejected
        assert_eq!(f.agent.accept_update(&update(&f, ops[2].clone())).await.unwrap(), 3);
        let err = f.agent.accept_update(&update(&f, next[1].clone())).await.unwrap_err();
        assert!(matches!(err, Error::OutOfSequence { expected: 4, got: 5 }));
        f.agent.accept_update(&update(&f, next[0].clone())).await.unwrap();
        f.agent.accept_update(&update(&f, next[1].clone())).await.unwrap();
        assert_eq!(f.agent.index.last_offset().await, 5);

        // Older generation rejected
        let mut stale = update(&f, next[1].clone());
        stale.generation = 0;
        let err = f.agent.accept_update(&stale).await.unwrap_err();
        assert!(matches!(err, Error::StaleLeader { .. }));
    }

    #[tokio::test]
    async fn test_buffered_updates_drained() {
        let f = fixture(100).await;
        write(&f, 3).await;
        {
            let mut local = f.agent.local.lock().await;
            local.state = ReplicaState::Recovering;
            local.leader_generation = f.leader.generation;
        }

        // Arrives while recovering: buffered and acked
        let op4 = write(&f, 1).await.remove(0);
        assert_eq!(f.agent.accept_update(&update(&f, op4)).await.unwrap(), 4);
        assert_eq!(f.agent.index.last_offset().await, 0);

        f.agent.recover(None).await.unwrap();
        assert_eq!(f.agent.index.last_offset().await, 4);
        assert!(f.agent.local.lock().await.buffer.is_empty());
    }

    #[tokio::test]
    async fn test_marker_recovery_and_stale_marker() {
        let f = fixture(100).await;
        write(&f, 2).await;

        let marker = RecoveryMarker::new(
            f.shard.clone(),
            "r2".into(),
            "leader".into(),
            f.leader.generation,
            MarkerReason::UpdateFailed { error: "no response".into() },
        );
        assert_eq!(f.agent.handle_marker(&marker).await.unwrap(), MarkerAction::Executed);
        assert_eq!(record_state(&f).await, (ReplicaState::Active, Some(marker.id)));

        // A marker from an older generation is deleted, not executed
        let m = RecoveryMarker::new(
            f.shard.clone(),
            "r2".into(),
            "old-leader".into(),
            f.leader.generation - 1,
            MarkerReason::OperatorRequest,
        );
        let stored = m.clone();
        f.store
            .update_marker(&f.shard, &"r2".into(), move |_| Ok(crate::state::Update::Put(stored.clone())))
            .await
            .unwrap();
        let replays = f.link.replays.load(Ordering::SeqCst);

        assert_eq!(f.agent.handle_marker(&m).await.unwrap(), MarkerAction::Discarded);
        assert!(f.store.marker(&f.shard, &"r2".into()).await.unwrap().is_none());
        assert_eq!(f.link.replays.load(Ordering::SeqCst), replays);
        assert_eq!(record_state(&f).await, (ReplicaState::Active, Some(marker.id)));
    }

    fn reported(f: &Fixture, state: ReplicaState) -> RecoveryMarker {
        RecoveryMarker::new(
            f.shard.clone(),
            "r2".into(),
            "leader".into(),
            f.leader.generation,
            MarkerReason::ReplicaReported { state },
        )
    }

    #[tokio::test]
    async fn test_marker_joins_startup_catch_up() {
        let f = fixture(100).await;
        write(&f, 3).await;

        // Startup catch-up is scheduled; the leader covers it with a marker
        assert!(f.agent.begin_startup().await);
        let marker = reported(&f, ReplicaState::Recovering);
        assert_eq!(f.agent.handle_marker(&marker).await.unwrap(), MarkerAction::Joined);
        assert_eq!(f.link.replays.load(Ordering::SeqCst), 0);

        f.agent.recover(None).await.unwrap();
        assert_eq!(record_state(&f).await, (ReplicaState::Active, Some(marker.id)));
        assert!(!f.agent.local.lock().await.in_flight);
    }

    #[tokio::test]
    async fn test_reported_marker_acknowledged_when_caught_up() {
        let f = fixture(100).await;
        write(&f, 2).await;
        f.agent.recover(None).await.unwrap();
        let replays = f.link.replays.load(Ordering::SeqCst);

        let marker = reported(&f, ReplicaState::Recovering);
        assert_eq!(f.agent.handle_marker(&marker).await.unwrap(), MarkerAction::Acknowledged);
        assert_eq!(f.link.replays.load(Ordering::SeqCst), replays);
        assert_eq!(record_state(&f).await, (ReplicaState::Active, Some(marker.id)));

        // Any other reason still runs a catch-up
        let marker = RecoveryMarker::new(
            f.shard.clone(),
            "r2".into(),
            "leader".into(),
            f.leader.generation,
            MarkerReason::OperatorRequest,
        );
        assert_eq!(f.agent.handle_marker(&marker).await.unwrap(), MarkerAction::Executed);
        assert!(f.link.replays.load(Ordering::SeqCst) > replays);
    }

    #[tokio::test]
    async fn test_failure_publishes_recovery_failed() {
        let f = fixture(100).await;
        write(&f, 2).await;
        f.elector.resign(&f.shard, &"leader".into(), f.leader.generation).await.unwrap();

        let err = f.agent.recover(None).await.unwrap_err();
        assert!(matches!(err, Error::RecoveryFailed { .. }));
        assert_eq!(f.agent.state().await, ReplicaState::RecoveryFailed);
        assert_eq!(record_state(&f).await.0, ReplicaState::RecoveryFailed);
        assert!(!f.agent.local.lock().await.in_flight);
    }
}
