//! The [`Mesh`] context object
//!
//! Owns the database handle and every federation component, and is the only
//! place they are wired together. Operations that touch more than one
//! component (connecting a peer also starting its replication, deleting one
//! also stopping it) live here so the HTTP layer stays thin.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::announce::AnnouncePublisher;
use crate::broker::{ConnectInput, ConnectionBroker};
use crate::client::{Announce, FederationClient};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::gossip::GossipResolver;
use crate::identity::IdentityStore;
use crate::keys::{ApiKeyRegistry, NewApiKey};
use crate::media::{CatalogItem, DownloadPipeline, LibraryMover};
use crate::networking::{NetworkStatus, NetworkingManager, PortMapper};
use crate::peers::{Peer, PeerDirectory, PeerPreferences, Upserted};
use crate::pull::PullCoordinator;
use crate::replication::ReplicationScheduler;
use crate::store::Database;
use crate::token::ConnectionToken;

/// Implementations of the outside world the mesh talks to
pub struct Collaborators {
    /// Outbound federation calls
    pub client: Arc<dyn FederationClient>,
    /// Gateway port mapping
    pub mapper: Arc<dyn PortMapper>,
    /// Acquisition pipeline used by pulls
    pub pipeline: Arc<dyn DownloadPipeline>,
    /// Library organizer used after auto-moved pulls
    pub mover: Arc<dyn LibraryMover>,
}

/// An item in a peer's catalog, annotated for the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteItem {
    /// The item as the peer lists it
    #[serde(flatten)]
    pub item: CatalogItem,
    /// Whether a transfer record already exists for it
    pub transferred: bool,
}

/// A peer's catalog as shown to the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerLibrary {
    /// The peer's own name for itself
    pub instance_name: String,
    /// Catalog entries
    pub items: Vec<RemoteItem>,
}

/// A new API key plus, when our address is known, a token embedding it
#[derive(Debug, Clone)]
pub struct IssuedKey {
    /// The key
    pub key: NewApiKey,
    /// Connection token for the other side, if the external URL is known
    pub connection_string: Option<String>,
}

/// A running federation node.
///
/// Build it with [`Mesh::init`], bring it online with [`Mesh::start`], and
/// stop it with [`Mesh::shutdown`].
pub struct Mesh {
    config: Config,
    db: Arc<Database>,
    client: Arc<dyn FederationClient>,
    identity: Arc<IdentityStore>,
    keys: Arc<ApiKeyRegistry>,
    peers: Arc<PeerDirectory>,
    broker: ConnectionBroker,
    announcer: Arc<AnnouncePublisher>,
    resolver: Arc<GossipResolver>,
    networking: Arc<NetworkingManager>,
    pulls: Arc<PullCoordinator>,
    scheduler: ReplicationScheduler,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Mesh {
    /// Open storage and wire every component. No network activity yet.
    pub fn init(config: Config, collaborators: Collaborators) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            Error::init(format!(
                "failed to create data directory {}: {e}",
                config.data_dir.display()
            ))
        })?;
        let db = Arc::new(Database::open(&config.database_path())?);
        Self::with_database(config, db, collaborators)
    }

    /// Wire every component over an already opened database
    pub fn with_database(config: Config, db: Arc<Database>, collaborators: Collaborators) -> Result<Self> {
        let Collaborators {
            client,
            mapper,
            pipeline,
            mover,
        } = collaborators;

        let identity = Arc::new(IdentityStore::load_or_create(db.clone(), &config.instance_name)?);
        let keys = Arc::new(ApiKeyRegistry::new(db.clone()));
        let peers = Arc::new(PeerDirectory::new(db.clone()));

        let broker = ConnectionBroker::new(
            identity.clone(),
            peers.clone(),
            client.clone(),
            config.connect_timeout,
        );
        let announcer = Arc::new(AnnouncePublisher::new(
            identity.clone(),
            peers.clone(),
            client.clone(),
            config.announce_timeout,
        ));
        let resolver = Arc::new(GossipResolver::new(
            peers.clone(),
            client.clone(),
            config.gossip_query_timeout,
            config.gossip_deadline,
        ));
        let networking = Arc::new(NetworkingManager::new(
            db.clone(),
            identity.clone(),
            mapper,
            config.api_port,
            config.upnp_timeout,
            config.upnp_lease,
        ));
        let pulls = Arc::new(PullCoordinator::new(db.clone(), peers.clone(), pipeline, mover));
        let scheduler = ReplicationScheduler::new(
            peers.clone(),
            client.clone(),
            pulls.clone(),
            resolver.clone(),
            config.sync_interval,
            config.connect_timeout,
        );

        info!(
            instance_id = %identity.id(),
            name = %identity.name(),
            data_dir = %config.data_dir.display(),
            "Mesh initialized"
        );

        Ok(Self {
            config,
            db,
            client,
            identity,
            keys,
            peers,
            broker,
            announcer,
            resolver,
            networking,
            pulls,
            scheduler,
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Determine our address, start announcing it, and start replication
    pub async fn start(&self) -> Result<NetworkStatus> {
        // Subscribe first so the initial address is announced too
        let changes = self.networking.subscribe();
        let status = self.networking.start().await?;

        let watcher = self
            .announcer
            .clone()
            .spawn_on_change(changes, self.shutdown.child_token());
        self.background.lock().push(watcher);

        let replicating = self.scheduler.reconcile()?;
        info!(
            external_url = ?status.external_url,
            upnp_active = status.upnp.active,
            replicating,
            "Mesh started"
        );
        Ok(status)
    }

    /// Stop background work and release the port mapping
    pub async fn shutdown(&self) {
        info!("Shutting down mesh");
        self.shutdown.cancel();
        self.scheduler.shutdown().await;

        let handles: Vec<_> = self.background.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.networking.release().await;
        debug!("Mesh shutdown complete");
    }

    // -------------------------------------------------------------------------
    // Cross-component operations
    // -------------------------------------------------------------------------

    /// Connect a peer and start replicating it if it was already set to
    pub async fn connect_peer(&self, input: ConnectInput) -> Result<Upserted> {
        let saved = self.broker.connect(input).await?;
        if saved.peer.auto_replicate {
            self.scheduler.enable(saved.peer.id);
        }
        Ok(saved)
    }

    /// Change a peer's preferences and start or stop its replication task
    pub fn update_peer(&self, peer_id: Uuid, prefs: &PeerPreferences) -> Result<Peer> {
        let peer = self.peers.set_preferences(peer_id, prefs)?;
        if peer.auto_replicate {
            self.scheduler.enable(peer.id);
        } else {
            self.scheduler.disable(peer.id);
        }
        Ok(peer)
    }

    /// Stop replicating a peer and forget it
    pub fn delete_peer(&self, peer_id: Uuid) -> Result<()> {
        self.scheduler.disable(peer_id);
        self.peers.delete(peer_id)
    }

    /// Fetch a peer's catalog, marking items already transferred
    pub async fn peer_library(&self, peer_id: Uuid) -> Result<PeerLibrary> {
        let peer = self.peers.get(peer_id)?;
        let library = self
            .client
            .library(&peer.url, &peer.api_key, self.config.connect_timeout)
            .await?;
        let transferred = self.pulls.transferred_items(peer_id)?;

        Ok(PeerLibrary {
            instance_name: library.instance_name,
            items: library
                .items
                .into_iter()
                .map(|item| RemoteItem {
                    transferred: transferred.contains(&item.id),
                    item,
                })
                .collect(),
        })
    }

    /// Issue an API key, with a connection token when our address is known
    pub fn issue_key(&self, label: &str) -> Result<IssuedKey> {
        let key = self.keys.create(label)?;
        let connection_string = self.networking.external_url().map(|url| {
            ConnectionToken {
                url,
                name: self.identity.name(),
                key: key.secret.clone(),
            }
            .encode()
        });
        Ok(IssuedKey {
            key,
            connection_string,
        })
    }

    /// Apply an inbound announce made with the key `key_id`.
    ///
    /// The key must belong to the announcing instance; see
    /// [`ApiKeyRegistry::bind_instance`].
    pub fn receive_announce(&self, key_id: Uuid, announce: &Announce) -> Result<bool> {
        if announce.instance_id != self.identity.id() {
            self.keys.bind_instance(key_id, announce.instance_id)?;
        }
        self.announcer.receive(announce)
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Configuration the mesh was built with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared database handle
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Instance identity
    pub fn identity(&self) -> &IdentityStore {
        &self.identity
    }

    /// Inbound credentials
    pub fn keys(&self) -> &ApiKeyRegistry {
        &self.keys
    }

    /// Peer records
    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    /// Announce sending and receiving
    pub fn announcer(&self) -> &AnnouncePublisher {
        &self.announcer
    }

    /// Gossip address resolution
    pub fn resolver(&self) -> &GossipResolver {
        &self.resolver
    }

    /// External address management
    pub fn networking(&self) -> &NetworkingManager {
        &self.networking
    }

    /// Single transfers
    pub fn pulls(&self) -> &PullCoordinator {
        &self.pulls
    }

    /// Per-peer replication tasks
    pub fn scheduler(&self) -> &ReplicationScheduler {
        &self.scheduler
    }
}
