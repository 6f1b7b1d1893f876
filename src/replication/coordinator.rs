//! Leader-Initiated Recovery Coordinator
//!
//! Runs on the shard leader. Decides when a replica must recover, writes the
//! recovery marker stamped with the leader's generation, and deletes it once
//! the replica reports it caught up under that marker.
//!
//! The phase of a replica is never stored. It is derived from the marker and
//! the replica record on every read:
//!
//! | marker | replica record                         | phase               |
//! |--------|----------------------------------------|---------------------|
//! | none   | RECOVERING                             | RECOVERING          |
//! | none   | RECOVERY_FAILED                        | RECOVERY_FAILED     |
//! | none   | anything else                          | ACTIVE              |
//! | timed out | any                                 | RECOVERY_FAILED     |
//! | id     | RECOVERING, ref = id                   | RECOVERING          |
//! | id     | RECOVERY_FAILED, ref = id              | RECOVERY_FAILED     |
//! | id     | anything else                          | MARKED_FOR_RECOVERY |
//!
//! A replica that publishes RECOVERING or RECOVERY_FAILED on its own (startup
//! catch-up, step-down, a new generation) is given a marker by the leader, so
//! no replica recovers without one.
//!
//! Decisions for different replicas take different locks; nothing locks the
//! whole shard.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::forwarder::UpdateOutcome;
use crate::config::RecoveryConfig;
use crate::error::{Error, Result};
use crate::state::{
    LeaderRecord, MarkerReason, RecoveryMarker, ReplicaId, ReplicaRecord, ReplicaState,
    ReplicaStateStore, ShardId, ShardLeaderElector, Update, UpdateResult,
};
use crate::store::{Version, WatchEvent};

/// Recovery phase of one replica as seen by the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryPhase {
    Active,
    MarkedForRecovery,
    Recovering,
    RecoveryFailed,
}

impl std::fmt::Display for RecoveryPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryPhase::Active => write!(f, "ACTIVE"),
            RecoveryPhase::MarkedForRecovery => write!(f, "MARKED_FOR_RECOVERY"),
            RecoveryPhase::Recovering => write!(f, "RECOVERING"),
            RecoveryPhase::RecoveryFailed => write!(f, "RECOVERY_FAILED"),
        }
    }
}

/// Derive a replica's phase from its marker and record
pub fn derive_phase(marker: Option<&RecoveryMarker>, record: Option<&ReplicaRecord>) -> RecoveryPhase {
    let Some(marker) = marker else {
        return match record.map(|r| r.state) {
            Some(ReplicaState::Recovering) => RecoveryPhase::Recovering,
            Some(ReplicaState::RecoveryFailed) => RecoveryPhase::RecoveryFailed,
            _ => RecoveryPhase::Active,
        };
    };
    if marker.timed_out_at.is_some() {
        return RecoveryPhase::RecoveryFailed;
    }

    match record {
        Some(r) if r.recovery_ref == Some(marker.id) => match r.state {
            ReplicaState::Recovering => RecoveryPhase::Recovering,
            ReplicaState::RecoveryFailed => RecoveryPhase::RecoveryFailed,
            ReplicaState::Active | ReplicaState::Down => RecoveryPhase::MarkedForRecovery,
        },
        _ => RecoveryPhase::MarkedForRecovery,
    }
}

fn in_recovery(record: &ReplicaRecord) -> bool {
    matches!(record.state, ReplicaState::Recovering | ReplicaState::RecoveryFailed)
}

/// Whether a marker's issue is finished, successfully or not, so a new
/// failure needs a fresh issue rather than the existing one
fn issue_finished(marker: &RecoveryMarker, record: Option<&ReplicaRecord>) -> bool {
    marker.timed_out_at.is_some()
        || record.is_some_and(|r| {
            r.recovery_ref == Some(marker.id)
                && matches!(r.state, ReplicaState::Active | ReplicaState::RecoveryFailed)
        })
}

/// What `mark_for_recovery` did
#[derive(Debug, Clone, PartialEq)]
pub enum MarkOutcome {
    /// No marker existed; one was written
    Created(RecoveryMarker),
    /// Marker from an older generation re-stamped with the current one
    Refreshed(RecoveryMarker),
    /// Finished marker replaced by a new issue
    Reissued(RecoveryMarker),
    /// Recovery already outstanding under the current generation
    AlreadyMarked(RecoveryMarker),
}

impl MarkOutcome {
    pub fn marker(&self) -> &RecoveryMarker {
        match self {
            MarkOutcome::Created(m)
            | MarkOutcome::Refreshed(m)
            | MarkOutcome::Reissued(m)
            | MarkOutcome::AlreadyMarked(m) => m,
        }
    }

    /// Whether this call wrote the marker
    pub fn wrote(&self) -> bool {
        !matches!(self, MarkOutcome::AlreadyMarked(_))
    }
}

#[derive(Clone, Copy)]
enum MarkKind {
    Created,
    Refreshed,
    Reissued,
}

/// Recovery status of one replica, for operators
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaRecoveryStatus {
    pub replica: ReplicaId,
    pub state: ReplicaState,
    pub generation: u64,
    pub phase: RecoveryPhase,
    pub marker: Option<RecoveryMarker>,
}

/// Last observed change of a RECOVERING replica's record
struct Progress {
    version: Version,
    since: Instant,
}

/// Per-shard recovery coordinator
pub struct LeaderInitiatedRecoveryCoordinator {
    shard: ShardId,
    /// Replica id of this node in the shard
    local: ReplicaId,
    store: ReplicaStateStore,
    elector: Arc<ShardLeaderElector>,
    config: RecoveryConfig,
    locks: std::sync::Mutex<HashMap<ReplicaId, Arc<Mutex<()>>>>,
    progress: std::sync::Mutex<HashMap<ReplicaId, Progress>>,
}

impl LeaderInitiatedRecoveryCoordinator {
    /// Create a coordinator for one shard
    pub fn new(
        shard: ShardId,
        local: ReplicaId,
        store: ReplicaStateStore,
        elector: Arc<ShardLeaderElector>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            shard,
            local,
            store,
            elector,
            config,
            locks: std::sync::Mutex::new(HashMap::new()),
            progress: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn shard(&self) -> &ShardId {
        &self.shard
    }

    fn lock_for(&self, replica: &ReplicaId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(replica.clone()).or_default())
    }

    fn forget(&self, replica: &ReplicaId) {
        self.progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(replica);
    }

    /// Current leader, which must be this node
    async fn authority(&self) -> Result<LeaderRecord> {
        let leader = self.elector.current_leader(&self.shard).await?;
        if leader.replica != self.local {
            return Err(Error::NotLeader {
                shard: self.shard.to_string(),
                leader: leader.replica.to_string(),
            });
        }
        Ok(leader)
    }

    /// Record that `replica` must recover. Idempotent: concurrent calls for the
    /// same outstanding recovery write the marker once.
    pub async fn mark_for_recovery(&self, replica: &ReplicaId, reason: MarkerReason) -> Result<MarkOutcome> {
        let lock = self.lock_for(replica);
        let _guard = lock.lock().await;
        self.mark_locked(replica, reason).await
    }

    /// `mark_for_recovery` with the replica's lock already held
    async fn mark_locked(&self, replica: &ReplicaId, reason: MarkerReason) -> Result<MarkOutcome> {
        let leader = self.authority().await?;
        let record = self.store.replica(&self.shard, replica).await?.map(|v| v.value);

        let mut kind = MarkKind::Created;
        let result = self
            .store
            .update_marker(&self.shard, replica, |current| match current {
                None => {
                    kind = MarkKind::Created;
                    Ok(Update::Put(RecoveryMarker::new(
                        self.shard.clone(),
                        replica.clone(),
                        leader.replica.clone(),
                        leader.generation,
                        reason.clone(),
                    )))
                }
                Some(m) if m.leader_generation > leader.generation => Err(Error::StaleAuthority {
                    shard: self.shard.to_string(),
                    marker_generation: m.leader_generation,
                    leader_generation: leader.generation,
                }),
                Some(m) if issue_finished(m, record.as_ref()) => {
                    kind = MarkKind::Reissued;
                    Ok(Update::Put(m.reissued(
                        leader.replica.clone(),
                        leader.generation,
                        reason.clone(),
                    )))
                }
                Some(m) if m.leader_generation < leader.generation => {
                    kind = MarkKind::Refreshed;
                    Ok(Update::Put(m.refreshed(leader.replica.clone(), leader.generation)))
                }
                Some(_) => Ok(Update::Keep),
            })
            .await?;

        let outcome = match result {
            UpdateResult::Written(v) => match kind {
                MarkKind::Created => MarkOutcome::Created(v.value),
                MarkKind::Refreshed => MarkOutcome::Refreshed(v.value),
                MarkKind::Reissued => MarkOutcome::Reissued(v.value),
            },
            UpdateResult::Unchanged(Some(v)) => MarkOutcome::AlreadyMarked(v.value),
            _ => {
                return Err(Error::Internal(format!(
                    "marker for {} on {} vanished while marking",
                    replica, self.shard
                )))
            }
        };

        let marker = outcome.marker();
        match &outcome {
            MarkOutcome::Created(_) => tracing::warn!(
                "Marked replica {} of {} for recovery (generation {}, marker {}): {}",
                replica,
                self.shard,
                marker.leader_generation,
                marker.id,
                marker.reason
            ),
            MarkOutcome::Refreshed(_) => tracing::info!(
                "Refreshed recovery marker {} for {} of {} to generation {}",
                marker.id,
                replica,
                self.shard,
                marker.leader_generation
            ),
            MarkOutcome::Reissued(_) => tracing::warn!(
                "Reissued recovery marker for {} of {} (attempt {}, marker {}): {}",
                replica,
                self.shard,
                marker.attempt,
                marker.id,
                marker.reason
            ),
            MarkOutcome::AlreadyMarked(_) => tracing::debug!(
                "Replica {} of {} already marked for recovery (marker {})",
                replica,
                self.shard,
                marker.id
            ),
        }
        Ok(outcome)
    }

    /// Act on the outcomes of one forwarded update. Unreachable replicas are
    /// marked; marking errors are logged, never surfaced to the write.
    pub async fn handle_outcomes(&self, outcomes: &BTreeMap<ReplicaId, UpdateOutcome>) -> Vec<(ReplicaId, MarkOutcome)> {
        let marks = outcomes.iter().filter_map(|(replica, outcome)| match outcome {
            UpdateOutcome::Unreachable { error } => Some(async move {
                let reason = MarkerReason::UpdateFailed { error: error.clone() };
                match self.mark_for_recovery(replica, reason).await {
                    Ok(outcome) => Some((replica.clone(), outcome)),
                    Err(e) => {
                        tracing::error!("Failed to mark {} of {} for recovery: {}", replica, self.shard, e);
                        None
                    }
                }
            }),
            UpdateOutcome::TransientFailure { error } => {
                tracing::debug!("Update to {} abandoned before retry: {}", replica, error);
                None
            }
            UpdateOutcome::Acked => None,
        });

        join_all(marks).await.into_iter().flatten().collect()
    }

    /// Re-evaluate one replica against the store: clear a marker the replica
    /// recovered under, discard markers from older generations, and time out
    /// recoveries that stopped making progress.
    pub async fn reconcile(&self, replica: &ReplicaId) -> Result<RecoveryPhase> {
        let lock = self.lock_for(replica);
        let _guard = lock.lock().await;

        let Some(marker) = self.store.marker(&self.shard, replica).await?.map(|v| v.value) else {
            self.forget(replica);
            return self.cover_reported(replica).await;
        };
        let record = self.store.replica(&self.shard, replica).await?;
        let phase = derive_phase(Some(&marker), record.as_ref().map(|v| &v.value));

        let leader = self
            .elector
            .live_leader(&self.shard)
            .await?
            .filter(|l| l.replica == self.local);
        let Some(leader) = leader else {
            return Ok(phase);
        };

        if marker.leader_generation < leader.generation {
            self.discard(&marker, leader.generation).await?;
            return Ok(RecoveryPhase::Active);
        }
        if marker.leader_generation > leader.generation {
            return Ok(phase);
        }

        let Some(record) = record else {
            return Ok(phase);
        };

        // Caught up under this marker; a timed-out marker is cleared too
        if record.value.state == ReplicaState::Active && record.value.recovery_ref == Some(marker.id) {
            if self
                .store
                .clear_marker(&self.shard, replica, marker.id, marker.leader_generation)
                .await?
            {
                self.forget(replica);
                tracing::info!(
                    "Replica {} of {} recovered; cleared marker {} (attempt {})",
                    replica,
                    self.shard,
                    marker.id,
                    marker.attempt
                );
                return Ok(RecoveryPhase::Active);
            }
            return Ok(phase);
        }

        if phase != RecoveryPhase::Recovering {
            return Ok(phase);
        }

        let stalled = {
            let now = Instant::now();
            let mut progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
            let entry = progress.entry(replica.clone()).or_insert(Progress {
                version: record.version,
                since: now,
            });
            if entry.version != record.version {
                entry.version = record.version;
                entry.since = now;
            }
            now.duration_since(entry.since) >= self.config.timeout()
        };

        if stalled && self.time_out(&marker).await? {
            return Ok(RecoveryPhase::RecoveryFailed);
        }
        Ok(phase)
    }

    /// Give a marker to a replica that published RECOVERING or RECOVERY_FAILED
    /// without one. Caller holds the replica's lock.
    async fn cover_reported(&self, replica: &ReplicaId) -> Result<RecoveryPhase> {
        let Some(record) = self.store.replica(&self.shard, replica).await?.map(|v| v.value) else {
            return Ok(RecoveryPhase::Active);
        };
        if replica == &self.local || !in_recovery(&record) {
            return Ok(derive_phase(None, Some(&record)));
        }
        let leads = self
            .elector
            .live_leader(&self.shard)
            .await?
            .is_some_and(|l| l.replica == self.local);
        if !leads {
            return Ok(derive_phase(None, Some(&record)));
        }

        let reason = MarkerReason::ReplicaReported { state: record.state };
        let outcome = self.mark_locked(replica, reason).await?;
        Ok(derive_phase(Some(outcome.marker()), Some(&record)))
    }

    /// Stamp a marker as timed out; true if this call did it
    async fn time_out(&self, marker: &RecoveryMarker) -> Result<bool> {
        let result = self
            .store
            .update_marker(&self.shard, &marker.replica, |current| {
                Ok(match current {
                    Some(m) if m.id == marker.id && m.timed_out_at.is_none() => Update::Put(RecoveryMarker {
                        timed_out_at: Some(Utc::now()),
                        ..m.clone()
                    }),
                    _ => Update::Keep,
                })
            })
            .await?;

        let stamped = matches!(result, UpdateResult::Written(_));
        if stamped {
            self.forget(&marker.replica);
            tracing::warn!(
                "Recovery of {} on {} made no progress for {:?}; marker {} is now RECOVERY_FAILED",
                marker.replica,
                self.shard,
                self.config.timeout(),
                marker.id
            );
        }
        Ok(stamped)
    }

    /// Delete a marker written under an older generation
    async fn discard(&self, marker: &RecoveryMarker, generation: u64) -> Result<bool> {
        let removed = self
            .store
            .clear_marker(&self.shard, &marker.replica, marker.id, marker.leader_generation)
            .await?;
        if removed {
            self.forget(&marker.replica);
            tracing::info!(
                "Invalidated recovery marker {} for {} of {} (generation {} < {})",
                marker.id,
                marker.replica,
                self.shard,
                marker.leader_generation,
                generation
            );
        }
        Ok(removed)
    }

    /// Delete every marker from a generation older than `generation`.
    /// Called when this node gains leadership.
    pub async fn invalidate_stale_markers(&self, generation: u64) -> Result<usize> {
        let mut removed = 0;
        for marker in self.store.markers(&self.shard).await? {
            if marker.leader_generation < generation {
                let lock = self.lock_for(&marker.replica);
                let _guard = lock.lock().await;
                if self.discard(&marker, generation).await? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Operator request to retry a replica's recovery
    pub async fn retry_recovery(&self, replica: &ReplicaId) -> Result<MarkOutcome> {
        if self.store.replica(&self.shard, replica).await?.is_none() {
            return Err(Error::ReplicaNotFound(replica.to_string()));
        }
        if replica == &self.local {
            return Err(Error::Internal(format!("{} leads {} and cannot be recovered", replica, self.shard)));
        }
        self.mark_for_recovery(replica, MarkerReason::OperatorRequest).await
    }

    /// Phase of every registered replica
    pub async fn recovery_status(&self) -> Result<Vec<ReplicaRecoveryStatus>> {
        let view = self.store.shard_view(&self.shard).await?;
        Ok(view
            .replicas
            .iter()
            .map(|record| {
                let marker = view.markers.iter().find(|m| m.replica == record.id).cloned();
                ReplicaRecoveryStatus {
                    replica: record.id.clone(),
                    state: record.state,
                    generation: record.generation,
                    phase: derive_phase(marker.as_ref(), Some(record)),
                    marker,
                }
            })
            .collect())
    }

    async fn reconcile_logged(&self, replica: &ReplicaId) {
        if let Err(e) = self.reconcile(replica).await {
            tracing::warn!("Recovery check for {} of {} failed: {}", replica, self.shard, e);
        }
    }

    /// Re-evaluate every replica that has a marker or reports a recovery state
    pub async fn reconcile_all(&self) {
        let view = match self.store.shard_view(&self.shard).await {
            Ok(view) => view,
            Err(e) => {
                tracing::warn!("Failed to read recovery state of {}: {}", self.shard, e);
                return;
            }
        };
        let replicas: BTreeSet<&ReplicaId> = view
            .markers
            .iter()
            .map(|m| &m.replica)
            .chain(view.replicas.iter().filter(|r| in_recovery(r)).map(|r| &r.id))
            .collect();
        join_all(replicas.into_iter().map(|r| self.reconcile_logged(r))).await;
    }

    fn replica_from_key(&self, key: &str) -> Option<ReplicaId> {
        let rest = key
            .strip_prefix(&self.shard.replicas_prefix())
            .or_else(|| key.strip_prefix(&self.shard.markers_prefix()))?;
        (!rest.is_empty()).then(|| ReplicaId::new(rest))
    }

    async fn on_event(&self, event: WatchEvent) {
        match event.key().and_then(|k| self.replica_from_key(k)) {
            Some(replica) => self.reconcile_logged(&replica).await,
            None => self.reconcile_all().await,
        }
    }

    /// Watch replica records and markers until cancelled, sweeping for
    /// timeouts every `check_interval`
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut replicas = self.store.watch_replicas(&self.shard);
        let mut markers = self.store.watch_markers(&self.shard);
        let mut ticker = tokio::time::interval(self.config.check_interval());

        tracing::info!("Recovery coordinator started for {}", self.shard);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = replicas.next() => self.on_event(event).await,
                Some(event) = markers.next() => self.on_event(event).await,
                _ = ticker.tick() => self.reconcile_all().await,
            }
        }
        tracing::info!("Recovery coordinator stopped for {}", self.shard);
    }
}
