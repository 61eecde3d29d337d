//! Configuration for a MediaMesh instance.
//!
//! This module provides the [`Config`] struct. Configuration covers storage
//! paths, the local HTTP port peers reach us on, background intervals and the
//! timeouts that bound every outbound federation call.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use mediamesh::Config;
//!
//! // Simple configuration with just a data directory
//! let config = Config::new("/path/to/data");
//!
//! // Full configuration with builder pattern
//! let config = Config::new("/path/to/data")
//!     .with_instance_name("Living Room")
//!     .with_api_port(3000)
//!     .with_sync_interval(Duration::from_secs(600));
//!
//! // Default configuration (uses platform-specific data directory)
//! let config = Config::default();
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_API_PORT, DEFAULT_SYNC_INTERVAL_SECS};

/// Configuration for a MediaMesh instance.
///
/// # Storage Layout
///
/// ```text
/// {data_dir}/
/// ├── mediamesh.db      # identity, keys, peers, transfer records, settings
/// ├── media/            # catalog exposed to peers (default media_dir)
/// ├── downloads/        # items pulled from peers
/// └── libraries/        # library folders items can be moved into
/// ```
///
/// # Defaults
///
/// - `instance_name`: `"MediaMesh"`
/// - `api_port`: 3000
/// - `sync_interval`: 15 minutes
/// - `announce_timeout`: 5 seconds per peer
/// - `gossip_query_timeout`: 3 seconds per peer, `gossip_deadline`: 8 seconds overall
/// - `connect_timeout`: 10 seconds
/// - `upnp_timeout`: 10 seconds, `upnp_lease`: 1 hour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the database and media folders.
    pub data_dir: PathBuf,

    /// Display name used only when the identity is first created.
    pub instance_name: String,

    /// Local TCP port the HTTP server binds, and the port UPnP maps.
    pub api_port: u16,

    /// Directory whose files form the catalog exposed to peers.
    ///
    /// `None` means `{data_dir}/media`.
    pub media_dir: Option<PathBuf>,

    /// How often each auto-replicating peer is polled.
    #[serde(with = "duration_secs")]
    pub sync_interval: Duration,

    /// Per-peer bound on a single announce call.
    #[serde(with = "duration_secs")]
    pub announce_timeout: Duration,

    /// Per-peer bound on a single gossip query.
    #[serde(with = "duration_secs")]
    pub gossip_query_timeout: Duration,

    /// Overall bound on a gossip fan-out.
    #[serde(with = "duration_secs")]
    pub gossip_deadline: Duration,

    /// Bound on the verification call made when connecting a peer, and on
    /// catalog listing requests.
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Bound on a single UPnP mapping attempt.
    #[serde(with = "duration_secs")]
    pub upnp_timeout: Duration,

    /// Lease requested from the gateway for the port mapping.
    #[serde(with = "duration_secs")]
    pub upnp_lease: Duration,
}

impl Config {
    /// Create a new configuration with the given data directory
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            instance_name: "MediaMesh".to_string(),
            api_port: DEFAULT_API_PORT,
            media_dir: None,
            sync_interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
            announce_timeout: Duration::from_secs(5),
            gossip_query_timeout: Duration::from_secs(3),
            gossip_deadline: Duration::from_secs(8),
            connect_timeout: Duration::from_secs(10),
            upnp_timeout: Duration::from_secs(10),
            upnp_lease: Duration::from_secs(3600),
        }
    }

    /// Set the instance name used on first run
    #[must_use]
    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = name.into();
        self
    }

    /// Set the API port
    #[must_use]
    pub const fn with_api_port(mut self, port: u16) -> Self {
        self.api_port = port;
        self
    }

    /// Set the catalog directory
    #[must_use]
    pub fn with_media_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.media_dir = Some(dir.into());
        self
    }

    /// Set the replication interval
    #[must_use]
    pub const fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Set the gossip timeouts (per query, overall)
    #[must_use]
    pub const fn with_gossip_timeouts(mut self, per_query: Duration, deadline: Duration) -> Self {
        self.gossip_query_timeout = per_query;
        self.gossip_deadline = deadline;
        self
    }

    /// Set the UPnP mapping timeout
    #[must_use]
    pub const fn with_upnp_timeout(mut self, timeout: Duration) -> Self {
        self.upnp_timeout = timeout;
        self
    }

    /// Get the default data directory
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mediamesh")
    }

    /// Path to the SQLite database
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("mediamesh.db")
    }

    /// Path to the catalog directory
    #[must_use]
    pub fn media_path(&self) -> PathBuf {
        self.media_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("media"))
    }

    /// Path to the downloads directory
    #[must_use]
    pub fn downloads_path(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }

    /// Path to the library root directory
    #[must_use]
    pub fn libraries_path(&self) -> PathBuf {
        self.data_dir.join("libraries")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Self::default_data_dir())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
