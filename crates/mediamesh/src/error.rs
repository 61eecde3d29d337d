//! Error types for MediaMesh.
//!
//! This module defines the [`enum@Error`] enum and [`Result`] type alias used throughout
//! the MediaMesh library.
//!
//! # Error Categories
//!
//! Errors are categorized by how the caller should react to them:
//!
//! - [`Error::Validation`] - Malformed input (URL, port, missing fields). Never retried.
//! - [`Error::Auth`] - Bad or revoked API key. Never retried.
//! - [`Error::Unreachable`] - Network failure or timeout talking to a peer
//! - [`Error::Conflict`] - The operation collides with existing state
//! - [`Error::NotFound`] - Unknown peer, key or item
//! - [`Error::NotResolvable`] - Peer cannot be gossip-resolved (identity unknown)
//! - [`Error::Storage`] - SQLite or filesystem failures
//! - [`Error::Init`] - Startup failures
//! - [`Error::Config`] - Configuration issues
//!
//! # Example
//!
//! ```rust,no_run
//! use mediamesh::{Error, Mesh};
//! use uuid::Uuid;
//!
//! # async fn example(mesh: &Mesh, peer_id: Uuid) -> mediamesh::Result<()> {
//! match mesh.resolver().resolve(peer_id).await {
//!     Ok(outcome) if outcome.resolved => println!("repaired via {:?}", outcome.via),
//!     Ok(_) => println!("no fresher address known"),
//!     Err(Error::NotResolvable(msg)) => eprintln!("cannot resolve: {msg}"),
//!     Err(e) => eprintln!("other error: {e}"),
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use thiserror::Error;

/// Result type alias for MediaMesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in MediaMesh operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Input failed validation
    #[error("validation failed: {0}")]
    Validation(Arc<str>),

    /// Credential missing, invalid or revoked
    #[error("authentication failed: {0}")]
    Auth(Arc<str>),

    /// Remote instance could not be reached in time
    #[error("peer unreachable: {0}")]
    Unreachable(Arc<str>),

    /// Operation conflicts with existing state
    #[error("conflict: {0}")]
    Conflict(Arc<str>),

    /// Entity does not exist
    #[error("not found: {0}")]
    NotFound(Arc<str>),

    /// Peer has no known instance id, so nobody can vouch for its address
    #[error("not resolvable: {0}")]
    NotResolvable(Arc<str>),

    /// Storage operation failed
    #[error("storage error: {0}")]
    Storage(Arc<str>),

    /// Failed to initialize a component
    #[error("initialization failed: {0}")]
    Init(Arc<str>),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(Arc<str>),
}

impl Error {
    /// Create a validation error
    #[inline]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(Arc::from(msg.into()))
    }

    /// Create an authentication error
    #[inline]
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(Arc::from(msg.into()))
    }

    /// Create an unreachable error
    #[inline]
    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::Unreachable(Arc::from(msg.into()))
    }

    /// Create a conflict error
    #[inline]
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(Arc::from(msg.into()))
    }

    /// Create a not-found error
    #[inline]
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(Arc::from(msg.into()))
    }

    /// Create a not-resolvable error
    #[inline]
    pub fn not_resolvable(msg: impl Into<String>) -> Self {
        Self::NotResolvable(Arc::from(msg.into()))
    }

    /// Create a storage error
    #[inline]
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(Arc::from(msg.into()))
    }

    /// Create an initialization error
    #[inline]
    pub fn init(msg: impl Into<String>) -> Self {
        Self::Init(Arc::from(msg.into()))
    }

    /// Create a configuration error
    #[inline]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(Arc::from(msg.into()))
    }

    /// Whether this error came from the network rather than from the peer's answer.
    ///
    /// Background tasks swallow these; interactive callers surface them.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::storage(e.to_string())
    }
}
