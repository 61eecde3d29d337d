//! MediaMesh Server library
//!
//! Re-exports the server modules for use by the binary and integration tests.

use std::sync::Arc;

use axum::Router;
use mediamesh::media::Catalog;
use mediamesh::Mesh;

pub mod api;
pub mod error;
pub mod federation;
pub mod local;

/// Shared application state
pub struct AppState {
    /// The federation node
    pub mesh: Arc<Mesh>,
    /// This instance's catalog, served to peers
    pub catalog: Arc<dyn Catalog>,
}

/// Operator and federation routes on one router
pub fn app(state: Arc<AppState>) -> Router {
    api::router(state.clone()).merge(federation::router(state))
}
