//! HTTP API Server
//!
//! REST API for client writes, status queries and operator actions.

use std::sync::Arc;
use axum::{
    extract::{Path, State, Json},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::index::{document_from_json, OperationKind};
use crate::replication::{
    MarkOutcome, NodeRuntime, ReplicaRecoveryStatus, ShardStatus, WriteReceipt,
};
use crate::state::{LeaderRecord, RecoveryMarker, ReplicaId, ShardId};

/// Shared application state
pub struct AppState {
    pub runtime: Arc<NodeRuntime>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, runtime: Arc<NodeRuntime>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { runtime }),
        }
    }

    /// Create the router
    pub fn router(state: Arc<AppState>) -> Router {
        Router::new()
            // Status and info
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/shards/:collection/:shard", get(handle_shard))
            // Writes
            .route("/shards/:collection/:shard/update", post(handle_update))
            .route("/shards/:collection/:shard/delete", post(handle_delete))
            .route("/shards/:collection/:shard/commit", post(handle_commit))
            // Operator actions
            .route(
                "/shards/:collection/:shard/recovery/:replica/retry",
                post(handle_retry_recovery),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve until `shutdown` is cancelled
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::router(Arc::clone(&self.state));

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Document update request
#[derive(Debug, Deserialize, Serialize)]
pub struct UpdateDocumentRequest {
    pub doc_id: String,
    /// JSON object of field values
    pub fields: serde_json::Value,
}

/// Document delete request
#[derive(Debug, Deserialize, Serialize)]
pub struct DeleteDocumentRequest {
    pub doc_id: String,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub shards: usize,
    pub leading: usize,
}

/// Status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub shards: Vec<ShardStatus>,
}

/// Detailed view of one shard
#[derive(Debug, Serialize)]
pub struct ShardResponse {
    pub status: ShardStatus,
    pub leader: Option<LeaderRecord>,
    pub replicas: Vec<ReplicaRecoveryStatus>,
}

/// Result of an operator recovery retry
#[derive(Debug, Serialize)]
pub struct RetryRecoveryResponse {
    pub replica: ReplicaId,
    /// created, refreshed, reissued or already_marked
    pub outcome: &'static str,
    pub marker: RecoveryMarker,
}

impl From<(ReplicaId, MarkOutcome)> for RetryRecoveryResponse {
    fn from((replica, outcome): (ReplicaId, MarkOutcome)) -> Self {
        let name = match &outcome {
            MarkOutcome::Created(_) => "created",
            MarkOutcome::Refreshed(_) => "refreshed",
            MarkOutcome::Reissued(_) => "reissued",
            MarkOutcome::AlreadyMarked(_) => "already_marked",
        };
        Self {
            replica,
            outcome: name,
            marker: outcome.marker().clone(),
        }
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Error mapped to an HTTP response
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            Error::ShardNotFound(_) => (StatusCode::NOT_FOUND, "SHARD_NOT_FOUND"),
            Error::ReplicaNotFound(_) => (StatusCode::NOT_FOUND, "REPLICA_NOT_FOUND"),
            Error::NotLeader { .. } => (StatusCode::CONFLICT, "NOT_LEADER"),
            Error::NoLeader(_) => (StatusCode::SERVICE_UNAVAILABLE, "NO_LEADER"),
            Error::ShuttingDown | Error::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
            Error::InvalidDocument(_) | Error::Json(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            e if e.is_no_response() => (StatusCode::GATEWAY_TIMEOUT, "NO_RESPONSE"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        if status.is_server_error() {
            tracing::warn!("API request failed: {}", self.0);
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            code: code.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let shards = state.runtime.status().await;
    Json(HealthResponse {
        healthy: true,
        node_id: state.runtime.node_id().to_string(),
        leading: shards.iter().filter(|s| s.is_leader).count(),
        shards: shards.len(),
    })
}

async fn handle_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        node_id: state.runtime.node_id().to_string(),
        shards: state.runtime.status().await,
    })
}

async fn handle_shard(
    State(state): State<Arc<AppState>>,
    Path((collection, shard)): Path<(String, String)>,
) -> ApiResult<ShardResponse> {
    let node = state.runtime.shard(&ShardId::new(collection, shard))?;
    Ok(Json(ShardResponse {
        status: node.status().await,
        leader: node.elector().live_leader(node.shard()).await?,
        replicas: node.recovery_status().await?,
    }))
}

async fn write(state: &AppState, shard: ShardId, kind: OperationKind) -> ApiResult<WriteReceipt> {
    let node = state.runtime.shard(&shard)?;
    Ok(Json(node.write(kind).await?))
}

async fn handle_update(
    State(state): State<Arc<AppState>>,
    Path((collection, shard)): Path<(String, String)>,
    Json(req): Json<UpdateDocumentRequest>,
) -> ApiResult<WriteReceipt> {
    let fields = document_from_json(&req.fields)?;
    let kind = OperationKind::Update {
        doc_id: req.doc_id,
        fields,
    };
    write(&state, ShardId::new(collection, shard), kind).await
}

async fn handle_delete(
    State(state): State<Arc<AppState>>,
    Path((collection, shard)): Path<(String, String)>,
    Json(req): Json<DeleteDocumentRequest>,
) -> ApiResult<WriteReceipt> {
    let kind = OperationKind::Delete { doc_id: req.doc_id };
    write(&state, ShardId::new(collection, shard), kind).await
}

async fn handle_commit(
    State(state): State<Arc<AppState>>,
    Path((collection, shard)): Path<(String, String)>,
) -> ApiResult<WriteReceipt> {
    write(&state, ShardId::new(collection, shard), OperationKind::Commit).await
}

async fn handle_retry_recovery(
    State(state): State<Arc<AppState>>,
    Path((collection, shard, replica)): Path<(String, String, String)>,
) -> ApiResult<RetryRecoveryResponse> {
    let node = state.runtime.shard(&ShardId::new(collection, shard))?;
    let replica = ReplicaId::new(replica);
    let outcome = node.retry_recovery(&replica).await?;
    Ok(Json(RetryRecoveryResponse::from((replica, outcome))))
}
