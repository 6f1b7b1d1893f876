//! ShardSync Configuration
//!
//! This module provides configuration structures for a ShardSync node:
//! which shards it hosts, how it reaches the coordination store, and the
//! retry, recovery and election parameters of the replication core.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::state::ShardId;

/// Main ShardSync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardSyncConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Coordination store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Shards hosted by this node
    #[serde(default)]
    pub shards: Vec<ShardConfig>,

    /// Update forwarding configuration
    #[serde(default)]
    pub forwarding: ForwardingConfig,

    /// Leader-initiated recovery configuration
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Leader election configuration
    #[serde(default)]
    pub election: ElectionConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier (also the replica id of every hosted shard)
    pub id: String,

    /// Address to bind for replica-to-replica communication
    pub bind_address: String,

    /// Data directory for the embedded coordination store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,
}

/// Coordination store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Durable SQLite file, shareable by processes on one host
    Sqlite,
    /// In-process only (single-process clusters and tests)
    Memory,
}

/// Coordination store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend to use
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,

    /// SQLite database path (defaults to `<data_dir>/coordination.db`)
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Poll interval for detecting writes made by other processes
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// A shard hosted by this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Collection name
    pub collection: String,
    /// Shard name within the collection
    pub shard: String,
}

impl ShardConfig {
    /// Shard identifier
    pub fn shard_id(&self) -> ShardId {
        ShardId::new(&self.collection, &self.shard)
    }
}

/// Update forwarding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingConfig {
    /// Retries allowed for a "no response" failure before escalating
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the retry in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Pooled peer connections idle longer than this are closed
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

/// Leader-initiated recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Time a RECOVERING replica may go without progress before RECOVERY_FAILED
    #[serde(default = "default_recovery_timeout_ms")]
    pub timeout_ms: u64,

    /// Interval of the coordinator's timeout sweep
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// Catch-up attempts before a replica publishes RECOVERY_FAILED
    #[serde(default = "default_catch_up_attempts")]
    pub catch_up_attempts: u32,

    /// Backoff between catch-up attempts in milliseconds
    #[serde(default = "default_catch_up_backoff_ms")]
    pub catch_up_backoff_ms: u64,

    /// Largest gap served by incremental replay; larger gaps need a snapshot
    #[serde(default = "default_max_replay_operations")]
    pub max_replay_operations: u64,

    /// Operations per replay batch
    #[serde(default = "default_replay_batch_size")]
    pub replay_batch_size: usize,

    /// Operations retained by the leader for incremental replay
    #[serde(default = "default_history_retention")]
    pub history_retention: usize,
}

/// Leader election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Attempts made by `current_leader` before giving up
    #[serde(default = "default_leader_retry_attempts")]
    pub leader_retry_attempts: u32,

    /// Initial backoff between leader lookups in milliseconds (doubles)
    #[serde(default = "default_leader_retry_backoff_ms")]
    pub leader_retry_backoff_ms: u64,

    /// Leader lease duration in milliseconds
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,

    /// Lease renewal interval in milliseconds
    #[serde(default = "default_lease_renew_ms")]
    pub lease_renew_ms: u64,

    /// Minimum randomized delay before standing for election
    #[serde(default = "default_election_delay_min_ms")]
    pub election_delay_min_ms: u64,

    /// Maximum randomized delay before standing for election
    #[serde(default = "default_election_delay_max_ms")]
    pub election_delay_max_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_store_backend() -> StoreBackend {
    StoreBackend::Sqlite
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_max_retries() -> u32 {
    1
}

fn default_retry_delay_ms() -> u64 {
    3000
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_idle_timeout_ms() -> u64 {
    60000
}

fn default_recovery_timeout_ms() -> u64 {
    60_000
}

fn default_check_interval_ms() -> u64 {
    1000
}

fn default_catch_up_attempts() -> u32 {
    3
}

fn default_catch_up_backoff_ms() -> u64 {
    1000
}

fn default_max_replay_operations() -> u64 {
    10_000
}

fn default_replay_batch_size() -> usize {
    500
}

fn default_history_retention() -> usize {
    100_000
}

fn default_leader_retry_attempts() -> u32 {
    8
}

fn default_leader_retry_backoff_ms() -> u64 {
    250
}

fn default_lease_ms() -> u64 {
    10_000
}

fn default_lease_renew_ms() -> u64 {
    2000
}

fn default_election_delay_min_ms() -> u64 {
    50
}

fn default_election_delay_max_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8983".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/shardsync")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

impl ForwardingConfig {
    /// Delay before the single retry
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// TCP connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Idle time after which a pooled connection is closed
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_recovery_timeout_ms(),
            check_interval_ms: default_check_interval_ms(),
            catch_up_attempts: default_catch_up_attempts(),
            catch_up_backoff_ms: default_catch_up_backoff_ms(),
            max_replay_operations: default_max_replay_operations(),
            replay_batch_size: default_replay_batch_size(),
            history_retention: default_history_retention(),
        }
    }
}

impl RecoveryConfig {
    /// Recovery timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Timeout sweep interval as Duration
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// Catch-up backoff as Duration
    pub fn catch_up_backoff(&self) -> Duration {
        Duration::from_millis(self.catch_up_backoff_ms)
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            leader_retry_attempts: default_leader_retry_attempts(),
            leader_retry_backoff_ms: default_leader_retry_backoff_ms(),
            lease_ms: default_lease_ms(),
            lease_renew_ms: default_lease_renew_ms(),
            election_delay_min_ms: default_election_delay_min_ms(),
            election_delay_max_ms: default_election_delay_max_ms(),
        }
    }
}

impl ElectionConfig {
    /// Leader lease as Duration
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    /// Lease renewal interval as Duration
    pub fn lease_renew_interval(&self) -> Duration {
        Duration::from_millis(self.lease_renew_ms)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ShardSyncConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ShardSyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        let mut seen = HashSet::new();
        for shard in &self.shards {
            if shard.collection.is_empty() || shard.shard.is_empty() {
                return Err(crate::Error::Config(
                    "shards entries need a collection and a shard name".into(),
                ));
            }
            if !seen.insert(shard.shard_id()) {
                return Err(crate::Error::Config(format!(
                    "shard {} listed more than once",
                    shard.shard_id()
                )));
            }
        }

        if self.forwarding.request_timeout_ms == 0 || self.forwarding.connect_timeout_ms == 0 {
            return Err(crate::Error::Config("forwarding timeouts must be non-zero".into()));
        }

        if self.recovery.timeout_ms == 0 || self.recovery.check_interval_ms == 0 {
            return Err(crate::Error::Config("recovery timeouts must be non-zero".into()));
        }

        if self.recovery.replay_batch_size == 0 {
            return Err(crate::Error::Config("recovery.replay_batch_size must be non-zero".into()));
        }

        if self.election.lease_renew_ms == 0 || self.election.lease_renew_ms >= self.election.lease_ms {
            return Err(crate::Error::Config(
                "election.lease_renew_ms must be non-zero and shorter than election.lease_ms".into(),
            ));
        }

        if self.election.election_delay_min_ms > self.election.election_delay_max_ms {
            return Err(crate::Error::Config(
                "election.election_delay_min_ms exceeds election_delay_max_ms".into(),
            ));
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the coordination store path
    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("coordination.db"))
    }

    /// Get the store poll interval as Duration
    pub fn store_poll_interval(&self) -> Duration {
        Duration::from_millis(self.store.poll_interval_ms)
    }

    /// Identifiers of the hosted shards
    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.iter().map(ShardConfig::shard_id).collect()
    }

    /// Render a starter configuration for `shardsync init`
    pub fn sample(node_id: &str) -> String {
        format!(
            r#"[node]
id = "{node_id}"
bind_address = "0.0.0.0:7700"
data_dir = "/var/lib/shardsync"

[store]
backend = "sqlite"

[[shards]]
collection = "collection1"
shard = "shard1"

[forwarding]
max_retries = 1
retry_delay_ms = 3000

[recovery]
timeout_ms = 60000

[election]
lease_ms = 10000
lease_renew_ms = 2000

[api]
bind_address = "0.0.0.0:8983"

[logging]
level = "info"
"#
        )
    }
}
