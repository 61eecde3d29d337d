//! Operator HTTP API: peers, networking, keys

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, patch, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use mediamesh::gossip::ResolveOutcome;
use mediamesh::identity::InstanceIdentity;
use mediamesh::keys::ApiKeyInfo;
use mediamesh::mesh::PeerLibrary;
use mediamesh::networking::{NetworkStatus, UpnpStatus};
use mediamesh::peers::Upserted;
use mediamesh::replication::ReplicationSummary;
use mediamesh::{ConnectInput, Peer, PeerPreferences, PullOptions, PullOutcome};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::AppState;

/// Create the operator router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/instance", get(get_instance).put(rename_instance))
        .route("/peers", get(list_peers).post(add_peer))
        .route("/peers/connect", post(connect_peer))
        .route("/peers/{id}", patch(update_peer).delete(delete_peer))
        .route("/peers/{id}/resolve", post(resolve_peer))
        .route("/peers/{id}/pull/{item_id}", post(pull_item))
        .route("/peers/{id}/replicate", post(replicate_peer))
        .route("/peers/{id}/library", get(peer_library))
        .route("/networking", get(networking_status))
        .route("/networking/external-url", put(set_external_url))
        .route("/networking/upnp-retry", post(retry_upnp))
        .route("/keys", get(list_keys).post(create_key))
        .route("/keys/{id}", delete(revoke_key))
        .with_state(state)
}

/// Health check endpoint
async fn health() -> &'static str {
    "ok"
}

// =============================================================================
// Instance
// =============================================================================

async fn get_instance(State(state): State<Arc<AppState>>) -> Json<InstanceIdentity> {
    Json(state.mesh.identity().get())
}

#[derive(Debug, Deserialize)]
struct RenameRequest {
    name: String,
}

async fn rename_instance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RenameRequest>,
) -> ApiResult<Json<InstanceIdentity>> {
    state.mesh.identity().rename(&req.name)?;
    Ok(Json(state.mesh.identity().get()))
}

// =============================================================================
// Peers
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectRequest {
    connection_string: String,
}

/// Request body for manual peer entry
#[derive(Debug, Deserialize)]
struct AddPeerRequest {
    #[serde(default)]
    name: String,
    url: String,
    #[serde(alias = "apiKey")]
    api_key: String,
}

fn saved(upserted: Upserted) -> (StatusCode, Json<Peer>) {
    let status = if upserted.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    (status, Json(upserted.peer))
}

async fn list_peers(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Peer>>> {
    Ok(Json(state.mesh.peers().list()?))
}

async fn connect_peer(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConnectRequest>,
) -> ApiResult<(StatusCode, Json<Peer>)> {
    let upserted = state
        .mesh
        .connect_peer(ConnectInput::Token(req.connection_string))
        .await?;
    Ok(saved(upserted))
}

async fn add_peer(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddPeerRequest>,
) -> ApiResult<(StatusCode, Json<Peer>)> {
    let upserted = state
        .mesh
        .connect_peer(ConnectInput::Manual {
            name: req.name,
            url: req.url,
            key: req.api_key,
        })
        .await?;
    Ok(saved(upserted))
}

/// Request body for peer updates.
///
/// `sync_library_id: null` clears the library; leaving the field out keeps it.
#[derive(Debug, Deserialize)]
struct UpdatePeerRequest {
    #[serde(default, alias = "autoReplicate")]
    auto_replicate: Option<bool>,
    #[serde(default, alias = "syncLibraryId", deserialize_with = "present")]
    sync_library_id: Option<Option<String>>,
}

/// Distinguish an explicit `null` from a missing field
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

async fn update_peer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdatePeerRequest>,
) -> ApiResult<Json<Peer>> {
    let prefs = PeerPreferences {
        auto_replicate: req.auto_replicate,
        sync_library_id: req
            .sync_library_id
            .map(|lib| lib.map(|l| l.trim().to_string()).filter(|l| !l.is_empty())),
    };
    Ok(Json(state.mesh.update_peer(id, &prefs)?))
}

async fn delete_peer(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    state.mesh.delete_peer(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resolve_peer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ResolveOutcome>> {
    Ok(Json(state.mesh.resolver().resolve(id).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    #[serde(default)]
    auto_move: bool,
    library_id: Option<String>,
    title: Option<String>,
}

async fn pull_item(
    State(state): State<Arc<AppState>>,
    Path((id, item_id)): Path<(Uuid, String)>,
    body: Option<Json<PullRequest>>,
) -> ApiResult<Json<PullOutcome>> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let outcome = state
        .mesh
        .pulls()
        .pull(
            id,
            &item_id,
            PullOptions {
                auto_move: req.auto_move,
                library_id: req.library_id,
                title: req.title,
            },
        )
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplicateRequest {
    library_id: Option<String>,
}

async fn replicate_peer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    body: Option<Json<ReplicateRequest>>,
) -> ApiResult<Json<ReplicationSummary>> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let summary = state.mesh.scheduler().replicate_now(id, req.library_id).await?;
    info!(peer = %id, queued = summary.queued, total = summary.total, "Manual replication finished");
    Ok(Json(summary))
}

async fn peer_library(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<PeerLibrary>> {
    Ok(Json(state.mesh.peer_library(id).await?))
}

// =============================================================================
// Networking
// =============================================================================

async fn networking_status(State(state): State<Arc<AppState>>) -> Json<NetworkStatus> {
    Json(state.mesh.networking().status())
}

#[derive(Debug, Deserialize)]
struct ExternalUrlRequest {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExternalUrlResponse {
    external_url: Option<String>,
}

async fn set_external_url(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExternalUrlRequest>,
) -> ApiResult<Json<ExternalUrlResponse>> {
    let external_url = state.mesh.networking().set_external_url(req.url.as_deref())?;
    Ok(Json(ExternalUrlResponse { external_url }))
}

#[derive(Debug, Default, Deserialize)]
struct UpnpRetryRequest {
    port: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpnpRetryResponse {
    external_url: Option<String>,
    upnp: UpnpStatus,
}

async fn retry_upnp(
    State(state): State<Arc<AppState>>,
    body: Option<Json<UpnpRetryRequest>>,
) -> ApiResult<Json<UpnpRetryResponse>> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let status = state.mesh.networking().retry_upnp(req.port).await?;
    Ok(Json(UpnpRetryResponse {
        external_url: status.external_url,
        upnp: status.upnp,
    }))
}

// =============================================================================
// API keys
// =============================================================================

#[derive(Debug, Deserialize)]
struct CreateKeyRequest {
    label: String,
}

/// A new key; the only response that ever contains the secret
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatedKey {
    id: Uuid,
    label: String,
    created_at: DateTime<Utc>,
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    connection_string: Option<String>,
}

async fn list_keys(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<ApiKeyInfo>>> {
    Ok(Json(state.mesh.keys().list()?))
}

async fn create_key(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateKeyRequest>,
) -> ApiResult<(StatusCode, Json<CreatedKey>)> {
    let issued = state.mesh.issue_key(&req.label)?;
    let info = issued.key.info;
    Ok((
        StatusCode::CREATED,
        Json(CreatedKey {
            id: info.id,
            label: info.label,
            created_at: info.created_at,
            key: issued.key.secret,
            connection_string: issued.connection_string,
        }),
    ))
}

async fn revoke_key(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    state.mesh.keys().revoke(id)?;
    Ok(StatusCode::NO_CONTENT)
}
