//! Shared helpers for integration tests.
//!
//! An in-process cluster: every node is a [`NodeRuntime`] over one shared
//! [`MemoryStore`], and peer traffic goes through a [`LocalNetwork`] that
//! can partition addresses, inject update failures and count deliveries.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;

use shardsync::config::{ElectionConfig, ForwardingConfig, RecoveryConfig};
use shardsync::error::{Error, Result};
use shardsync::index::{Document, FieldValue, MemoryIndex, OperationKind};
use shardsync::network::MessageHandler;
use shardsync::replication::{Message, MessageSender, MessageTransport, NodeRuntime, NodeSettings, ShardNode};
use shardsync::state::{RecoveryMarker, ReplicaId, ReplicaState, ReplicaStateStore, ShardId};
use shardsync::store::MemoryStore;

/// How long any single wait may take before the test fails.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(15);
/// Poll interval of the wait helpers.
pub const POLL: Duration = Duration::from_millis(20);

/// Short delays so a whole recovery fits in well under a second.
pub fn settings() -> NodeSettings {
    NodeSettings {
        forwarding: ForwardingConfig {
            max_retries: 1,
            retry_delay_ms: 50,
            connect_timeout_ms: 200,
            request_timeout_ms: 500,
            idle_timeout_ms: 60_000,
        },
        recovery: RecoveryConfig {
            timeout_ms: 3_000,
            check_interval_ms: 50,
            catch_up_attempts: 3,
            catch_up_backoff_ms: 50,
            max_replay_operations: 1_000,
            replay_batch_size: 2,
            history_retention: 1_000,
        },
        election: ElectionConfig {
            leader_retry_attempts: 6,
            leader_retry_backoff_ms: 20,
            lease_ms: 1_000,
            lease_renew_ms: 50,
            election_delay_min_ms: 0,
            election_delay_max_ms: 20,
        },
    }
}

pub fn shard(name: &str) -> ShardId {
    ShardId::new("collection1", name)
}

pub fn address(node: &str) -> String {
    format!("{}:7700", node)
}

/// An update write carrying one string field
pub fn update(doc_id: &str, title: &str) -> OperationKind {
    let mut fields = Document::new();
    fields.insert("title".to_string(), FieldValue::String(title.to_string()));
    OperationKind::Update {
        doc_id: doc_id.to_string(),
        fields,
    }
}

// ============ Network ============

/// Loopback network between the nodes of one test
#[derive(Default)]
pub struct LocalNetwork {
    routes: RwLock<HashMap<String, Arc<NodeRuntime>>>,
    partitions: Mutex<HashSet<(String, String)>>,
    update_faults: Mutex<HashMap<(String, ShardId), u32>>,
    update_attempts: Mutex<HashMap<(String, String), u32>>,
}

impl LocalNetwork {
    pub fn register(&self, address: &str, runtime: Arc<NodeRuntime>) {
        self.routes.write().unwrap().insert(address.to_string(), runtime);
    }

    /// Drop all traffic between two addresses, both directions
    pub fn partition(&self, a: &str, b: &str) {
        let mut partitions = self.partitions.lock().unwrap();
        partitions.insert((a.to_string(), b.to_string()));
        partitions.insert((b.to_string(), a.to_string()));
    }

    /// Partition one address from each of `peers`
    pub fn isolate(&self, address: &str, peers: &[String]) {
        for peer in peers {
            self.partition(address, peer);
        }
    }

    /// Remove every partition
    pub fn heal(&self) {
        self.partitions.lock().unwrap().clear();
    }

    /// Reject the next `count` updates of `shard` sent to `to`
    pub fn fail_updates(&self, to: &str, shard: &ShardId, count: u32) {
        self.update_faults
            .lock()
            .unwrap()
            .insert((to.to_string(), shard.clone()), count);
    }

    /// Update messages sent from `from` to `to` so far, delivered or not
    pub fn update_attempts(&self, from: &str, to: &str) -> u32 {
        self.update_attempts
            .lock()
            .unwrap()
            .get(&(from.to_string(), to.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn injected_fault(&self, to: &str, message: &Message) -> bool {
        let Message::Update(request) = message else {
            return false;
        };
        let mut faults = self.update_faults.lock().unwrap();
        match faults.get_mut(&(to.to_string(), request.shard.clone())) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    async fn deliver(&self, from: &str, to: &str, message: Message) -> Result<Message> {
        if let Message::Update(_) = message {
            *self
                .update_attempts
                .lock()
                .unwrap()
                .entry((from.to_string(), to.to_string()))
                .or_insert(0) += 1;
        }

        if self.partitions.lock().unwrap().contains(&(from.to_string(), to.to_string())) {
            return Err(Error::NoResponse(to.to_string()));
        }
        if self.injected_fault(to, &message) {
            return Err(Error::Network(format!("update to {} dropped", to)));
        }

        let runtime = self.routes.read().unwrap().get(to).cloned();
        match runtime {
            Some(runtime) => Ok(runtime.handle(from, message).await),
            None => Err(Error::ConnectionFailed {
                address: to.to_string(),
                reason: "no such node".into(),
            }),
        }
    }
}

/// One node's end of the local network
pub struct Link {
    network: Arc<LocalNetwork>,
    from: String,
}

#[async_trait::async_trait]
impl MessageSender for Link {
    async fn request(&self, address: &str, message: Message) -> Result<Message> {
        self.network.deliver(&self.from, address, message).await
    }
}

// ============ Cluster ============

/// Nodes hosting every shard of the test, sharing one store and network
pub struct Cluster {
    pub store: ReplicaStateStore,
    pub network: Arc<LocalNetwork>,
    pub shards: Vec<ShardId>,
    runtimes: BTreeMap<String, Arc<NodeRuntime>>,
}

impl Cluster {
    pub fn new(nodes: &[&str], shards: &[ShardId], settings: NodeSettings) -> Self {
        let store = ReplicaStateStore::new(Arc::new(MemoryStore::new()));
        let network = Arc::new(LocalNetwork::default());

        let runtimes = nodes
            .iter()
            .map(|id| {
                let transport = Arc::new(MessageTransport::new(Link {
                    network: Arc::clone(&network),
                    from: address(id),
                }));
                let shard_nodes = shards
                    .iter()
                    .map(|shard| {
                        Arc::new(ShardNode::new(
                            shard.clone(),
                            ReplicaId::new(*id),
                            address(id),
                            store.clone(),
                            Arc::new(MemoryIndex::new(settings.recovery.history_retention)),
                            transport.clone(),
                            settings.clone(),
                        ))
                    })
                    .collect();
                let runtime = Arc::new(NodeRuntime::new(*id, shard_nodes));
                network.register(&address(id), Arc::clone(&runtime));
                (id.to_string(), runtime)
            })
            .collect();

        Self {
            store,
            network,
            shards: shards.to_vec(),
            runtimes,
        }
    }

    /// Start the first node, let it lead every shard, then start the rest
    /// and wait until every copy is ACTIVE with no marker left
    pub async fn start(nodes: &[&str], shards: &[ShardId], settings: NodeSettings) -> Self {
        let cluster = Self::new(nodes, shards, settings);
        let (first, rest) = nodes.split_first().expect("at least one node");

        cluster.runtime(first).start().await.unwrap();
        for shard in shards {
            let leader = cluster.wait_for_leader(shard).await;
            assert_eq!(leader.replica().as_str(), *first);
        }
        for id in rest {
            cluster.runtime(id).start().await.unwrap();
        }
        for shard in shards {
            for id in nodes {
                cluster.wait_for_state(shard, id, ReplicaState::Active).await;
            }
            // Startup catch-up runs under a marker the leader gives it
            cluster.wait_for_no_markers(shard).await;
        }
        cluster
    }

    pub async fn stop(&self) {
        for runtime in self.runtimes.values() {
            let _ = runtime.stop().await;
        }
    }

    pub fn runtime(&self, id: &str) -> &Arc<NodeRuntime> {
        &self.runtimes[id]
    }

    pub fn node(&self, id: &str, shard: &ShardId) -> Arc<ShardNode> {
        Arc::clone(self.runtime(id).shard(shard).unwrap())
    }

    /// Addresses of every node except `id`
    pub fn peers_of(&self, id: &str) -> Vec<String> {
        self.runtimes.keys().filter(|k| *k != id).map(|k| address(k)).collect()
    }

    pub async fn state(&self, shard: &ShardId, id: &str) -> Option<ReplicaState> {
        self.store
            .replica(shard, &ReplicaId::new(id))
            .await
            .unwrap()
            .map(|v| v.value.state)
    }

    pub async fn marker(&self, shard: &ShardId, id: &str) -> Option<RecoveryMarker> {
        self.store
            .marker(shard, &ReplicaId::new(id))
            .await
            .unwrap()
            .map(|v| v.value)
    }

    /// Node that both believes it leads and holds the live lease
    pub async fn wait_for_leader(&self, shard: &ShardId) -> Arc<ShardNode> {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            for runtime in self.runtimes.values() {
                let Ok(node) = runtime.shard(shard) else { continue };
                if !node.role().await.is_leader() {
                    continue;
                }
                let live = node.elector().live_leader(shard).await.unwrap();
                if live.is_some_and(|l| &l.replica == node.replica()) {
                    return Arc::clone(node);
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "no leader for {}", shard);
            tokio::time::sleep(POLL).await;
        }
    }

    pub async fn wait_for_state(&self, shard: &ShardId, id: &str, state: ReplicaState) {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let current = self.state(shard, id).await;
            if current == Some(state) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{} of {} never reached {} (last {:?})",
                id,
                shard,
                state,
                current
            );
            tokio::time::sleep(POLL).await;
        }
    }

    /// Wait until the replica publishes one of `states`
    pub async fn wait_for_any_state(&self, shard: &ShardId, id: &str, states: &[ReplicaState]) -> ReplicaState {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            if let Some(current) = self.state(shard, id).await {
                if states.contains(&current) {
                    return current;
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "{} of {} never reached {:?}", id, shard, states);
            tokio::time::sleep(POLL).await;
        }
    }

    pub async fn wait_for_marker(&self, shard: &ShardId, id: &str) -> RecoveryMarker {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            if let Some(marker) = self.marker(shard, id).await {
                return marker;
            }
            assert!(tokio::time::Instant::now() < deadline, "{} of {} was never marked", id, shard);
            tokio::time::sleep(POLL).await;
        }
    }

    pub async fn wait_for_no_markers(&self, shard: &ShardId) {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let markers = self.store.markers(shard).await.unwrap();
            if markers.is_empty() {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "markers of {} never cleared: {:?}",
                shard,
                markers
            );
            tokio::time::sleep(POLL).await;
        }
    }

    /// Wait until the copy on `id` has applied everything the leader has
    pub async fn wait_for_offset(&self, shard: &ShardId, id: &str, offset: u64) {
        let node = self.node(id, shard);
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        while node.index().last_offset().await < offset {
            assert!(tokio::time::Instant::now() < deadline, "{} of {} stuck below offset {}", id, shard, offset);
            tokio::time::sleep(POLL).await;
        }
    }
}

// ============ State history ============

/// Records the published state sequence of every replica of a shard
pub struct StateRecorder {
    seen: Arc<Mutex<BTreeMap<ReplicaId, Vec<ReplicaState>>>>,
    task: JoinHandle<()>,
}

impl StateRecorder {
    pub fn start(store: &ReplicaStateStore, shard: &ShardId) -> Self {
        let seen: Arc<Mutex<BTreeMap<ReplicaId, Vec<ReplicaState>>>> = Arc::default();
        let mut events = store.watch_replicas(shard);
        let task = tokio::spawn({
            let store = store.clone();
            let shard = shard.clone();
            let seen = Arc::clone(&seen);
            async move {
                loop {
                    if let Ok(replicas) = store.replicas(&shard).await {
                        let mut seen = seen.lock().unwrap();
                        for record in replicas {
                            let history = seen.entry(record.id).or_default();
                            if history.last() != Some(&record.state) {
                                history.push(record.state);
                            }
                        }
                    }
                    if events.next().await.is_none() {
                        break;
                    }
                }
            }
        });
        Self { seen, task }
    }

    pub fn history(&self, id: &str) -> Vec<ReplicaState> {
        self.seen
            .lock()
            .unwrap()
            .get(&ReplicaId::new(id))
            .cloned()
            .unwrap_or_default()
    }
}

impl Drop for StateRecorder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Whether `history` visits states in the order of `path`, possibly skipping some
pub fn follows_path(history: &[ReplicaState], path: &[ReplicaState]) -> bool {
    let mut path = path.iter();
    history.iter().all(|state| path.any(|p| p == state))
}
