//! ShardSync - Shard Replica Synchronization Node
//!
//! Hosts replicas of one or more shards: forwards writes from shard leaders
//! to replicas and recovers replicas that fall out of sync.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shardsync::api::HttpServer;
use shardsync::config::{ShardSyncConfig, StoreBackend};
use shardsync::error::Result;
use shardsync::network::{NetworkClient, NetworkServer};
use shardsync::replication::{NodeRuntime, ReplicaTransport, TcpTransport};
use shardsync::state::ReplicaStateStore;
use shardsync::store::{CoordinationStore, MemoryStore, SqliteStore};

/// ShardSync - Shard Replica Synchronization Node
#[derive(Parser)]
#[command(name = "shardsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "shardsync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "shardsync.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The configured level applies only when the file loads and no CLI level is given
    let configured = ShardSyncConfig::from_file(&cli.config)
        .ok()
        .map(|c| c.logging.level);
    let level = cli
        .log_level
        .clone()
        .or(configured)
        .unwrap_or_else(|| "info".to_string());
    init_logging(&level);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Open the configured coordination store
fn open_store(config: &ShardSyncConfig, cancel: &CancellationToken) -> Result<Arc<dyn CoordinationStore>> {
    match config.store.backend {
        StoreBackend::Sqlite => {
            let path = config.store_path();
            let store = Arc::new(SqliteStore::open(&path)?);
            let _poller = store.start_poller(config.store_poll_interval(), cancel.child_token());
            tracing::info!("Coordination store: SQLite at {}", path.display());
            Ok(store)
        }
        StoreBackend::Memory => {
            tracing::warn!("Coordination store: in-memory; state is lost on exit and not shared with other processes");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Start the node
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting ShardSync node...");

    let config = match ShardSyncConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    tracing::info!(
        "Loaded configuration for node {} hosting {} shard(s)",
        config.node.id,
        config.shards.len()
    );

    if let Err(e) = std::fs::create_dir_all(config.data_dir()) {
        tracing::error!("Failed to create data directory {:?}: {}", config.data_dir(), e);
        return Err(e.into());
    }

    let shutdown = CancellationToken::new();
    let store = ReplicaStateStore::new(open_store(&config, &shutdown)?);

    let client = NetworkClient::new(
        config.forwarding.connect_timeout(),
        config.forwarding.request_timeout(),
    );
    let tcp = Arc::new(TcpTransport::new(client));
    let pool_task = tokio::spawn(prune_idle_connections(
        Arc::clone(&tcp),
        config.forwarding.idle_timeout(),
        shutdown.child_token(),
    ));
    let transport: Arc<dyn ReplicaTransport> = tcp;

    let runtime = Arc::new(NodeRuntime::from_config(&config, store, transport));

    // Accept peer traffic before the shards start publishing state
    let server = Arc::new(NetworkServer::bind(&config.node.bind_address, runtime.clone()).await?);
    let server_task = tokio::spawn({
        let server = Arc::clone(&server);
        async move {
            if let Err(e) = server.serve().await {
                tracing::error!("Network server error: {}", e);
            }
        }
    });

    runtime.start().await?;
    for node in runtime.nodes() {
        tracing::info!("Hosting {} as replica {}", node.shard(), node.replica());
    }

    let api_task = tokio::spawn({
        let api = HttpServer::new(config.api.clone(), runtime.clone());
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = api.start(shutdown).await {
                tracing::error!("HTTP API error: {}", e);
            }
        }
    });

    tracing::info!("ShardSync node {} running; press Ctrl+C to stop", config.node.id);
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }

    tracing::info!("Shutting down...");
    let stopped = runtime.stop().await;
    shutdown.cancel();
    server.stop();
    let _ = tokio::join!(server_task, api_task, pool_task);

    stopped?;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Close pooled peer connections that sat idle for longer than `idle`
async fn prune_idle_connections(transport: Arc<TcpTransport>, idle: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(idle.max(Duration::from_secs(1)) / 2);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => transport.sender().cleanup_stale(idle).await,
        }
    }
}

/// Write a starter configuration
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    std::fs::write(&output, ShardSyncConfig::sample(&node_id))?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to list the shards this node hosts.");
    println!("Then start with: shardsync --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match ShardSyncConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Shards: {}", config.shards.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = ShardSyncConfig::from_file(&config_path)?;

    println!("ShardSync Node Information");
    println!("==========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Advertise:        {}", config.advertise_address());
    println!("Data Directory:   {}", config.data_dir().display());
    println!();
    println!("Coordination Store:");
    println!("  Backend:        {:?}", config.store.backend);
    println!("  Path:           {}", config.store_path().display());
    println!("  Poll Interval:  {} ms", config.store.poll_interval_ms);
    println!();
    println!("Shards:");
    for shard in config.shard_ids() {
        println!("  {}", shard);
    }
    println!();
    println!("Forwarding:");
    println!("  Retries:        {}", config.forwarding.max_retries);
    println!("  Retry Delay:    {} ms", config.forwarding.retry_delay_ms);
    println!("  Request Timeout:{} ms", config.forwarding.request_timeout_ms);
    println!();
    println!("Recovery:");
    println!("  Timeout:        {} ms", config.recovery.timeout_ms);
    println!("  Max Replay:     {} operations", config.recovery.max_replay_operations);
    println!("  Retention:      {} operations", config.recovery.history_retention);
    println!();
    println!("Election:");
    println!("  Lease:          {} ms (renew every {} ms)", config.election.lease_ms, config.election.lease_renew_ms);
    println!();
    println!("API:");
    println!("  Enabled:        {}", config.api.enabled);
    println!("  Bind Address:   {}", config.api.bind_address);

    Ok(())
}
