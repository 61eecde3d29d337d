//! # MediaMesh - Federation layer for self-hosted media managers
//!
//! MediaMesh links independent instances of a media-download manager into a
//! loosely coupled mesh. Each instance exposes its catalog to trusted peers,
//! pulls items it does not have, and keeps finding its peers while their
//! addresses change underneath it (dynamic IPs, NAT, restarts).
//!
//! ## Features
//!
//! - **Stable identity**: every instance has a permanent UUID; peers are
//!   matched by it, never by address.
//! - **Self-healing addresses**: instances announce their address on change,
//!   and stale addresses are repaired by asking other peers (gossip).
//!   Freshness is last-writer-wins on the time an address was seen.
//! - **NAT traversal**: UPnP port mapping, or a manually configured URL.
//! - **Replication**: optional periodic pull of everything a peer offers.
//! - **Idempotent transfers**: pulling the same item twice is a no-op.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use mediamesh::{Collaborators, Config, ConnectInput, HttpFederationClient, IgdPortMapper, Mesh};
//! # use mediamesh::media::{DownloadPipeline, LibraryMover};
//!
//! # async fn example(
//! #     pipeline: Arc<dyn DownloadPipeline>,
//! #     mover: Arc<dyn LibraryMover>,
//! # ) -> mediamesh::Result<()> {
//! let config = Config::new("/var/lib/mediamesh").with_instance_name("Living Room");
//! let mesh = Mesh::init(
//!     config,
//!     Collaborators {
//!         client: Arc::new(HttpFederationClient::new()),
//!         mapper: Arc::new(IgdPortMapper::new(Duration::from_secs(5))),
//!         pipeline,
//!         mover,
//!     },
//! )?;
//!
//! // Map a port (or use the manual URL), announce it, start replication
//! let status = mesh.start().await?;
//! println!("reachable at {:?}", status.external_url);
//!
//! // Link with another instance using the token it issued
//! let saved = mesh.connect_peer(ConnectInput::Token("adbconn_...".into())).await?;
//! println!("connected to {}", saved.peer.name);
//!
//! mesh.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - [`mesh`]: The [`Mesh`] context object wiring everything together
//! - [`identity`], [`keys`], [`peers`]: Persistent state
//! - [`broker`], [`token`]: Creating peers from tokens or manual input
//! - [`announce`], [`gossip`]: Keeping peer addresses current
//! - [`networking`]: External address via UPnP or manual URL
//! - [`replication`], [`pull`]: Moving items between instances
//! - [`client`]: Outbound federation HTTP calls
//! - [`media`]: Traits for the catalog, download pipeline and library
//! - [`config`], [`error`], [`store`]: Plumbing

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all)]

// =============================================================================
// Public modules
// =============================================================================

pub mod announce;
pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod gossip;
pub mod identity;
pub mod keys;
pub mod media;
pub mod mesh;
pub mod networking;
pub mod peers;
pub mod pull;
pub mod replication;
pub mod store;
pub mod token;

// =============================================================================
// Public re-exports
// =============================================================================

pub use broker::ConnectInput;
pub use client::{FederationClient, HttpFederationClient, API_KEY_HEADER};
pub use config::Config;
pub use error::{Error, Result};
pub use mesh::{Collaborators, Mesh};
pub use networking::IgdPortMapper;
pub use peers::{Peer, PeerPreferences};
pub use pull::{PullOptions, PullOutcome};

// =============================================================================
// Constants
// =============================================================================

/// Default port of the HTTP API, and the port UPnP tries to map.
pub const DEFAULT_API_PORT: u16 = 3000;

/// Default interval between replication cycles, in seconds.
///
/// Can be configured via [`Config::with_sync_interval`].
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 900;
