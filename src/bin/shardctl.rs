//! ShardCtl - Command line tool for operating ShardSync nodes
//!
//! Usage:
//!   shardctl status                             - Show the shards hosted by a node
//!   shardctl shard <collection> <shard>         - Show leader and replica recovery phases
//!   shardctl update <collection> <shard> <id> <json>
//!   shardctl delete <collection> <shard> <id>
//!   shardctl commit <collection> <shard>
//!   shardctl retry-recovery <collection> <shard> <replica>
//!   shardctl check-config

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use shardsync::config::ShardSyncConfig;

/// ShardSync Control Tool
#[derive(Parser)]
#[command(name = "shardctl")]
#[command(about = "Operate and monitor ShardSync nodes", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/shardsync/config.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show status of the shards hosted by the node
    Status,
    /// Show leader and per-replica recovery phases of one shard
    Shard { collection: String, shard: String },
    /// Add or replace a document
    Update {
        collection: String,
        shard: String,
        doc_id: String,
        /// Document fields as a JSON object
        fields: String,
    },
    /// Delete a document
    Delete {
        collection: String,
        shard: String,
        doc_id: String,
    },
    /// Commit a shard
    Commit { collection: String, shard: String },
    /// Ask the shard leader to retry a replica's recovery
    RetryRecovery {
        collection: String,
        shard: String,
        replica: String,
    },
    /// Check configuration file for errors
    CheckConfig {
        /// Path to config file to check (defaults to --config path)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

// ============ API Response Types ============

#[derive(Debug, Deserialize)]
struct StatusResponse {
    node_id: String,
    shards: Vec<ShardStatus>,
}

#[derive(Debug, Deserialize)]
struct ShardStatus {
    shard: ShardId,
    replica: String,
    is_leader: bool,
    generation: u64,
    state: String,
    last_offset: u64,
    #[serde(default)]
    documents: usize,
}

#[derive(Debug, Deserialize)]
struct ShardId {
    collection: String,
    shard: String,
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.collection, self.shard)
    }
}

#[derive(Debug, Deserialize)]
struct ShardResponse {
    status: ShardStatus,
    leader: Option<LeaderRecord>,
    replicas: Vec<ReplicaRecoveryStatus>,
}

#[derive(Debug, Deserialize)]
struct LeaderRecord {
    replica: String,
    address: String,
    generation: u64,
}

#[derive(Debug, Deserialize)]
struct ReplicaRecoveryStatus {
    replica: String,
    state: String,
    generation: u64,
    phase: String,
    marker: Option<Marker>,
}

#[derive(Debug, Deserialize)]
struct Marker {
    id: String,
    leader_generation: u64,
    attempt: u32,
}

#[derive(Debug, Deserialize)]
struct WriteReceipt {
    offset: u64,
    leader: String,
    generation: u64,
    outcomes: std::collections::BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RetryRecoveryResponse {
    replica: String,
    outcome: String,
    marker: Marker,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

// ============ Config ============

/// Endpoint and retry settings read from the node configuration
struct Target {
    endpoint: String,
    retry_delay: Duration,
}

fn target(cli: &Cli) -> Target {
    let config = ShardSyncConfig::from_file(&cli.config).ok();
    let retry_delay = config
        .as_ref()
        .map(|c| c.forwarding.retry_delay())
        .unwrap_or(Duration::from_secs(3));

    let endpoint = match (&cli.endpoint, &config) {
        (Some(e), _) => e.clone(),
        (None, Some(config)) => {
            // Convert bind address to localhost if it's 0.0.0.0
            let addr = &config.api.bind_address;
            if addr.starts_with("0.0.0.0") {
                format!("http://127.0.0.1:{}", addr.split(':').nth(1).unwrap_or("8983"))
            } else {
                format!("http://{}", addr)
            }
        }
        (None, None) => "http://127.0.0.1:8983".to_string(),
    };

    Target { endpoint, retry_delay }
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let target = target(&cli);

    let result = match &cli.command {
        Commands::Status => show_status(&target).await,
        Commands::Shard { collection, shard } => show_shard(&target, collection, shard).await,
        Commands::Update {
            collection,
            shard,
            doc_id,
            fields,
        } => match serde_json::from_str::<serde_json::Value>(fields) {
            Ok(fields) => {
                let body = serde_json::json!({ "doc_id": doc_id, "fields": fields });
                write(&target, collection, shard, "update", Some(body)).await
            }
            Err(e) => Err(format!("fields must be JSON: {}", e).into()),
        },
        Commands::Delete {
            collection,
            shard,
            doc_id,
        } => {
            let body = serde_json::json!({ "doc_id": doc_id });
            write(&target, collection, shard, "delete", Some(body)).await
        }
        Commands::Commit { collection, shard } => write(&target, collection, shard, "commit", None).await,
        Commands::RetryRecovery {
            collection,
            shard,
            replica,
        } => retry_recovery(&target, collection, shard, replica).await,
        Commands::CheckConfig { file } => {
            let config_path = file.clone().unwrap_or_else(|| cli.config.clone());
            check_config(&config_path)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

async fn api_error(response: reqwest::Response) -> Box<dyn std::error::Error> {
    let status = response.status();
    match response.json::<ErrorResponse>().await {
        Ok(e) => format!("{} ({}): {}", status, e.code, e.error).into(),
        Err(_) => format!("API error: {}", status).into(),
    }
}

// ============ Commands ============

fn colored_state(state: &str) -> String {
    // Pad to fixed width BEFORE adding color codes
    let padded = format!("{:<20}", state);
    match state {
        "ACTIVE" => format!("\x1b[32m{}\x1b[0m", padded),
        "RECOVERING" | "MARKED_FOR_RECOVERY" => format!("\x1b[33m{}\x1b[0m", padded),
        "RECOVERY_FAILED" | "DOWN" => format!("\x1b[31m{}\x1b[0m", padded),
        _ => padded,
    }
}

async fn show_status(target: &Target) -> CliResult {
    let response = reqwest::get(format!("{}/status", target.endpoint)).await?;
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }
    let status: StatusResponse = response.json().await?;

    println!();
    println!("ShardSync Node {} (shardctl v{})", status.node_id, env!("CARGO_PKG_VERSION"));
    println!("========================================");
    println!();
    println!("{:<30} {:<12} {:<20} {:<8} {:<10} {:<10} {:<10}",
        "SHARD", "REPLICA", "STATE", "ROLE", "GEN", "OFFSET", "DOCS");
    println!("{}", "-".repeat(100));

    for shard in &status.shards {
        let role = if shard.is_leader {
            format!("\x1b[1;34m{:<8}\x1b[0m", "LEADER")
        } else {
            format!("{:<8}", "REPLICA")
        };
        println!("{:<30} {:<12} {} {} {:<10} {:<10} {:<10}",
            shard.shard.to_string(),
            shard.replica,
            colored_state(&shard.state),
            role,
            shard.generation,
            shard.last_offset,
            shard.documents
        );
    }
    println!();
    Ok(())
}

async fn show_shard(target: &Target, collection: &str, shard: &str) -> CliResult {
    let url = format!("{}/shards/{}/{}", target.endpoint, collection, shard);
    let response = reqwest::get(&url).await?;
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }
    let view: ShardResponse = response.json().await?;

    println!();
    println!("Shard {}", view.status.shard);
    println!("========================================");
    match &view.leader {
        Some(leader) => println!("Leader: {} at {} (generation {})", leader.replica, leader.address, leader.generation),
        None => println!("Leader: NONE"),
    }
    println!();
    println!("{:<15} {:<20} {:<20} {:<6} {:<38} {:<8}",
        "REPLICA", "STATE", "PHASE", "GEN", "MARKER", "ATTEMPT");
    println!("{}", "-".repeat(110));

    for replica in &view.replicas {
        let (marker, attempt) = match &replica.marker {
            Some(m) => (format!("{} (g{})", m.id, m.leader_generation), m.attempt.to_string()),
            None => ("-".to_string(), "-".to_string()),
        };
        println!("{:<15} {} {} {:<6} {:<38} {:<8}",
            replica.replica,
            colored_state(&replica.state),
            colored_state(&replica.phase),
            replica.generation,
            marker,
            attempt
        );
    }
    println!();
    Ok(())
}

/// Submit a write. A request that gets no response is retried once after
/// the configured delay.
async fn write(
    target: &Target,
    collection: &str,
    shard: &str,
    action: &str,
    body: Option<serde_json::Value>,
) -> CliResult {
    let url = format!("{}/shards/{}/{}/{}", target.endpoint, collection, shard, action);
    let client = reqwest::Client::builder().timeout(Duration::from_secs(30)).build()?;

    let send = || {
        let request = client.post(&url);
        match &body {
            Some(body) => request.json(body).send(),
            None => request.send(),
        }
    };

    let response = match send().await {
        Ok(response) => response,
        Err(e) if e.is_timeout() || e.is_connect() => {
            eprintln!("No response from {} ({}); retrying in {:?}", target.endpoint, e, target.retry_delay);
            tokio::time::sleep(target.retry_delay).await;
            send().await?
        }
        Err(e) => return Err(e.into()),
    };

    if !response.status().is_success() {
        return Err(api_error(response).await);
    }
    let receipt: WriteReceipt = response.json().await?;

    println!("\x1b[1;32m✓\x1b[0m {} accepted at offset {} by {} (generation {})",
        action, receipt.offset, receipt.leader, receipt.generation);
    for (replica, outcome) in &receipt.outcomes {
        let text = match outcome {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        println!("  {:<15} {}", replica, text);
    }
    Ok(())
}

async fn retry_recovery(target: &Target, collection: &str, shard: &str, replica: &str) -> CliResult {
    let url = format!(
        "{}/shards/{}/{}/recovery/{}/retry",
        target.endpoint, collection, shard, replica
    );
    let response = reqwest::Client::new().post(&url).send().await?;
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }
    let result: RetryRecoveryResponse = response.json().await?;
    println!("\x1b[1;32m✓\x1b[0m Recovery of {} {}: marker {} (attempt {}, generation {})",
        result.replica, result.outcome, result.marker.id, result.marker.attempt, result.marker.leader_generation);
    Ok(())
}

fn check_config(path: &PathBuf) -> CliResult {
    println!();
    println!("ShardSync Configuration Check");
    println!("=============================");
    println!();

    if !path.exists() {
        println!("\x1b[1;31m✗ ERROR:\x1b[0m Config file not found: {}", path.display());
        return Err(format!("{} not found", path.display()).into());
    }
    println!("\x1b[1;32m✓\x1b[0m Config file: {}", path.display());

    let config = match ShardSyncConfig::from_file(path) {
        Ok(c) => c,
        Err(e) => {
            println!("\x1b[1;31m✗ ERROR:\x1b[0m {}", e);
            return Err(e.into());
        }
    };
    println!("\x1b[1;32m✓\x1b[0m Configuration is valid");
    println!();

    let mut warnings = Vec::new();
    if config.shards.is_empty() {
        warnings.push("No [[shards]] configured; the node will host nothing".to_string());
    }
    if config.recovery.history_retention < config.recovery.max_replay_operations as usize {
        warnings.push(format!(
            "recovery.history_retention ({}) is below max_replay_operations ({}); replays will fall back to snapshots early",
            config.recovery.history_retention, config.recovery.max_replay_operations
        ));
    }
    if config.forwarding.retry_delay_ms >= config.recovery.timeout_ms {
        warnings.push("forwarding.retry_delay_ms is not shorter than recovery.timeout_ms".to_string());
    }
    if config.store.backend == shardsync::config::StoreBackend::Memory {
        warnings.push("store.backend = \"memory\" keeps coordination state inside one process".to_string());
    }

    println!("  Node ID:       {}", config.node.id);
    println!("  Bind Address:  {}", config.node.bind_address);
    println!("  Store:         {:?} ({})", config.store.backend, config.store_path().display());
    for shard in config.shard_ids() {
        println!("  Shard:         {}", shard);
    }
    println!();

    for warning in &warnings {
        println!("\x1b[1;33m⚠ WARNING:\x1b[0m {}", warning);
    }
    if warnings.is_empty() {
        println!("\x1b[1;32m✓\x1b[0m No warnings");
    }
    println!();
    Ok(())
}
