//! HTTP status endpoint — exposes this node's view of the cluster as JSON.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use shoal_core::error::ClusterError;
use shoal_core::record::{DownVote, ExistenceMap, InventoryRecord, PeerRecord, VOTE_PREFIX};
use shoal_core::wire::ReadyState;
use shoal_services::store;
use shoal_services::{
    HttpTransfer, Inventory, Locator, Membership, PeerRegistry, Placement, ReplicationIntent,
    ReplicationReport,
};

#[derive(Clone)]
pub struct StatusState {
    pub membership: Arc<Membership>,
    pub registry:   PeerRegistry,
    pub locator:    Arc<Locator>,
    pub placement:  Arc<Placement<HttpTransfer>>,
    /// Present on store nodes only.
    pub inventory:  Option<Arc<Inventory>>,
}

type ApiError = (StatusCode, String);

fn api_error(e: ClusterError) -> ApiError {
    let code = match &e {
        ClusterError::Validation(_) => StatusCode::BAD_REQUEST,
        ClusterError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, e.to_string())
}

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub name:        String,
    pub kind:        String,
    pub ready_state: ReadyState,
    pub peers:       usize,
    pub available:   usize,
    pub ranked:      Vec<String>,
}

async fn handle_status(State(state): State<StatusState>) -> Result<Json<StatusResponse>, ApiError> {
    let peers = state.registry.all().map_err(api_error)?;
    let identity = state.membership.identity();
    Ok(Json(StatusResponse {
        name:        identity.name.clone(),
        kind:        identity.kind.as_str().to_string(),
        ready_state: state.membership.ready_state(),
        peers:       peers.len(),
        available:   peers.iter().filter(|p| p.available).count(),
        ranked:      state.registry.ranked_by_capacity(),
    }))
}

// ── /peers ────────────────────────────────────────────────────────────────────

async fn handle_peers(State(state): State<StatusState>) -> Result<Json<Vec<PeerRecord>>, ApiError> {
    state.registry.all().map(Json).map_err(api_error)
}

// ── /votes ────────────────────────────────────────────────────────────────────

async fn handle_votes(State(state): State<StatusState>) -> Result<Json<Vec<DownVote>>, ApiError> {
    store::scan(state.registry.store().as_ref(), VOTE_PREFIX)
        .map(Json)
        .map_err(api_error)
}

// ── /locate/{hash} ───────────────────────────────────────────────────────────

async fn handle_locate(
    State(state): State<StatusState>,
    Path(hash): Path<String>,
) -> Result<Json<ExistenceMap>, ApiError> {
    state.locator.locate_cached(&hash).await.map(Json).map_err(api_error)
}

// ── /route/{hash} ────────────────────────────────────────────────────────────

async fn handle_route(
    State(state): State<StatusState>,
    Path(hash): Path<String>,
) -> Result<Json<PeerRecord>, ApiError> {
    let existence = state.locator.locate_cached(&hash).await.map_err(api_error)?;
    state
        .placement
        .read_target(&hash, &existence)
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("no available holder of {hash}")))
}

// ── /write-target ────────────────────────────────────────────────────────────

async fn handle_write_target(State(state): State<StatusState>) -> Result<Json<PeerRecord>, ApiError> {
    state
        .placement
        .write_target(&HashSet::new())
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(|| (StatusCode::SERVICE_UNAVAILABLE, "no writable store".to_string()))
}

// ── /replicate/{hash} ────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ReplicateRequest {
    pub desired:   usize,
    #[serde(default)]
    pub protected: Vec<String>,
}

async fn handle_replicate(
    State(state): State<StatusState>,
    Path(hash): Path<String>,
    Json(req): Json<ReplicateRequest>,
) -> Result<Json<ReplicationReport>, ApiError> {
    let existence = state.locator.locate(&hash).await.map_err(api_error)?;
    let locations = state.placement.locations(&existence).map_err(api_error)?;
    let intent = ReplicationIntent::compute(hash, locations, req.desired);
    tracing::info!(hash = %intent.hash, delta = ?intent.delta, "replication requested");

    let protected: HashSet<String> = req.protected.into_iter().collect();
    state
        .placement
        .apply(&intent, &protected)
        .await
        .map(Json)
        .map_err(api_error)
}

// ── /inventory/{hash} ────────────────────────────────────────────────────────
//
// The local content layer reports copies it gains or loses here.

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct InventoryEntry {
    pub mime_type:      String,
    pub mime_extension: String,
    pub relative_path:  String,
}

fn local_inventory(state: &StatusState) -> Result<&Arc<Inventory>, ApiError> {
    state
        .inventory
        .as_ref()
        .ok_or_else(|| (StatusCode::NOT_FOUND, "this node holds no content".to_string()))
}

async fn handle_inventory_put(
    State(state): State<StatusState>,
    Path(hash): Path<String>,
    Json(entry): Json<InventoryEntry>,
) -> Result<(StatusCode, Json<InventoryRecord>), ApiError> {
    let inventory = local_inventory(&state)?;
    let fresh = !inventory.contains(&hash);
    let record = inventory
        .add(&hash, &entry.mime_type, &entry.mime_extension, &entry.relative_path)
        .map_err(api_error)?;
    state.locator.invalidate(&hash);

    if !fresh {
        return Ok((StatusCode::OK, Json(record)));
    }
    state.membership.record_import();
    tracing::info!(hash = %hash, path = %record.relative_path, "content imported");
    Ok((StatusCode::CREATED, Json(record)))
}

async fn handle_inventory_delete(
    State(state): State<StatusState>,
    Path(hash): Path<String>,
) -> Result<StatusCode, ApiError> {
    let inventory = local_inventory(&state)?;
    let held = inventory.remove(&hash).map_err(api_error)?;
    state.locator.invalidate(&hash);
    if !held {
        return Err((StatusCode::NOT_FOUND, format!("{hash} is not held here")));
    }
    tracing::info!(hash = %hash, "content dropped");
    Ok(StatusCode::NO_CONTENT)
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: StatusState) -> Router {
    let api = Router::new()
        .route("/status",       get(handle_status))
        .route("/peers",        get(handle_peers))
        .route("/votes",        get(handle_votes))
        .route("/locate/{hash}", get(handle_locate))
        .route("/route/{hash}",  get(handle_route))
        .route("/write-target",  get(handle_write_target))
        .route("/replicate/{hash}", post(handle_replicate))
        .route("/inventory/{hash}", put(handle_inventory_put).delete(handle_inventory_delete))
        .with_state(state);
    Router::new().nest("/api", api)
}

pub async fn serve(
    state: StatusState,
    port: u16,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "status endpoint listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}
