//! Federation HTTP API, called by peer instances
//!
//! Every route requires an `X-Api-Key` header holding a key issued by this
//! instance. Keys are checked against the registry on each request, so a
//! revoked key stops working immediately.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use mediamesh::client::{Announce, LocateRequest, LocateResponse, RemoteInstance, RemoteLibrary};
use mediamesh::{Error, API_KEY_HEADER};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// Create the federation router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/federation/info", get(info))
        .route("/federation/announce", post(announce))
        .route("/federation/resolve", post(resolve))
        .route("/federation/library", get(library))
        .route("/federation/items/{item_id}/stream", get(stream_item))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}

/// Id of the key that authenticated the request
#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedKey(pub Uuid);

/// Reject requests without a valid API key
async fn require_api_key(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::auth(format!("missing {API_KEY_HEADER} header")))?;

    match state.mesh.keys().validate(key) {
        Ok(key_id) => {
            debug!(key = %key_id, path = %request.uri().path(), "Federation request authenticated");
            request.extensions_mut().insert(AuthenticatedKey(key_id));
            Ok(next.run(request).await)
        }
        Err(e) => {
            warn!(path = %request.uri().path(), "Federation request rejected: invalid API key");
            Err(e.into())
        }
    }
}

async fn info(State(state): State<Arc<AppState>>) -> Json<RemoteInstance> {
    let identity = state.mesh.identity().get();
    Json(RemoteInstance {
        instance_id: identity.id,
        instance_name: identity.name,
    })
}

async fn announce(
    State(state): State<Arc<AppState>>,
    Extension(AuthenticatedKey(key_id)): Extension<AuthenticatedKey>,
    Json(announce): Json<Announce>,
) -> ApiResult<StatusCode> {
    let applied = state.mesh.receive_announce(key_id, &announce)?;
    debug!(instance = %announce.instance_id, applied, "Announce received");
    Ok(StatusCode::NO_CONTENT)
}

async fn resolve(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LocateRequest>,
) -> ApiResult<Json<LocateResponse>> {
    Ok(Json(state.mesh.resolver().answer(req.instance_id)?))
}

async fn library(State(state): State<Arc<AppState>>) -> ApiResult<Json<RemoteLibrary>> {
    let items = state.catalog.list_items().await?;
    Ok(Json(RemoteLibrary {
        instance_name: state.mesh.identity().name(),
        items,
    }))
}

async fn stream_item(State(state): State<Arc<AppState>>, Path(item_id): Path<String>) -> ApiResult<Response> {
    let source = state
        .catalog
        .open_item(&item_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("item {item_id}")))?;

    let file = tokio::fs::File::open(&source.path)
        .await
        .map_err(|e| Error::storage(format!("failed to open {}: {e}", source.path.display())))?;
    info!(item = %item_id, bytes = source.size_bytes, "Streaming item to peer");

    let disposition = HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        source.file_name.replace(['"', '\\'], "_")
    ))
    .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
            (header::CONTENT_LENGTH, HeaderValue::from(source.size_bytes)),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}
