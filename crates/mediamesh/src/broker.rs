//! Connection broker
//!
//! Turns an operator's input, either a connection token or manually typed
//! fields, into a verified peer record. The remote is contacted before
//! anything is written, so every failure leaves the directory untouched.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::client::FederationClient;
use crate::error::{Error, Result};
use crate::identity::IdentityStore;
use crate::peers::{PeerDirectory, Upserted, VerifiedPeer};
use crate::token::{normalize_url, ConnectionToken};

/// What the operator supplied
#[derive(Debug, Clone)]
pub enum ConnectInput {
    /// An opaque token from the other instance
    Token(String),
    /// Explicit fields
    Manual {
        /// Display name; empty means use the remote's own name
        name: String,
        /// Base URL
        url: String,
        /// API key issued by the remote
        key: String,
    },
}

/// Creates peer records from verified connection attempts
pub struct ConnectionBroker {
    identity: Arc<IdentityStore>,
    peers: Arc<PeerDirectory>,
    client: Arc<dyn FederationClient>,
    timeout: Duration,
}

impl ConnectionBroker {
    /// Create a broker
    pub fn new(
        identity: Arc<IdentityStore>,
        peers: Arc<PeerDirectory>,
        client: Arc<dyn FederationClient>,
        timeout: Duration,
    ) -> Self {
        Self {
            identity,
            peers,
            client,
            timeout,
        }
    }

    /// Verify the input against the remote and save the peer
    pub async fn connect(&self, input: ConnectInput) -> Result<Upserted> {
        let (name, url, key) = match input {
            ConnectInput::Token(token) => {
                let token = ConnectionToken::decode(&token)?;
                (token.name, token.url, token.key)
            }
            ConnectInput::Manual { name, url, key } => (name, url, key),
        };

        let url = normalize_url(&url)?;
        let key = key.trim().to_string();
        if key.is_empty() {
            return Err(Error::validation("API key is required"));
        }

        let remote = self.client.info(&url, &key, self.timeout).await.map_err(|e| {
            warn!(url = %url, error = %e, "Peer verification failed");
            e
        })?;

        if remote.instance_id == self.identity.id() {
            return Err(Error::validation("cannot connect an instance to itself"));
        }

        let name = match name.trim() {
            "" => remote.instance_name.clone(),
            given => given.to_string(),
        };

        let saved = self.peers.upsert_verified(
            VerifiedPeer {
                name,
                url,
                api_key: key,
                remote_instance_id: remote.instance_id,
            },
            Utc::now(),
        )?;

        info!(
            peer = %saved.peer.id,
            remote_instance = %remote.instance_id,
            created = saved.created,
            "Peer connected"
        );
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    use super::*;
    use crate::client::fake::{FakeFederation, FakePeer};
    use crate::store::Database;

    struct Fixture {
        broker: ConnectionBroker,
        peers: Arc<PeerDirectory>,
        fed: Arc<FakeFederation>,
        identity: Arc<IdentityStore>,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let identity = Arc::new(IdentityStore::load_or_create(db.clone(), "Local").unwrap());
        let peers = Arc::new(PeerDirectory::new(db));
        let fed = Arc::new(FakeFederation::default());
        let broker = ConnectionBroker::new(
            identity.clone(),
            peers.clone(),
            fed.clone(),
            Duration::from_secs(1),
        );
        Fixture {
            broker,
            peers,
            fed,
            identity,
        }
    }

    #[tokio::test]
    async fn test_connect_with_token() {
        let f = fixture();
        f.fed
            .add("http://5.6.7.8:3000", FakePeer::new("Whatever", "adb_key123"));

        let token = STANDARD
            .encode(r#"{"url":"http://5.6.7.8:3000","name":"RemoteNode","key":"adb_key123"}"#);
        let saved = f.broker.connect(ConnectInput::Token(token)).await.unwrap();

        assert!(saved.created);
        assert_eq!(saved.peer.name, "RemoteNode");
        assert_eq!(saved.peer.url, "http://5.6.7.8:3000");
        assert!(saved.peer.remote_instance_id.is_some());
        assert!(saved.peer.last_seen.is_some());
    }

    #[tokio::test]
    async fn test_reconnect_updates_in_place() {
        let f = fixture();
        let remote = FakePeer::new("Remote", "adb_k");
        let instance = remote.identity.instance_id;
        f.fed.add("http://old:3000", remote.clone());
        f.fed.add("http://new:3000", remote);

        let manual = |url: &str| ConnectInput::Manual {
            name: String::new(),
            url: url.to_string(),
            key: "adb_k".to_string(),
        };
        let first = f.broker.connect(manual("http://old:3000")).await.unwrap();
        let second = f.broker.connect(manual("http://new:3000/")).await.unwrap();

        assert!(!second.created);
        assert_eq!(first.peer.id, second.peer.id);
        assert_eq!(second.peer.url, "http://new:3000");
        assert_eq!(second.peer.name, "Remote");
        assert_eq!(second.peer.remote_instance_id, Some(instance));
        assert_eq!(f.peers.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failures_create_no_peer() {
        let f = fixture();
        f.fed.add("http://up:3000", FakePeer::new("Up", "adb_right"));

        let bad_url = ConnectInput::Manual {
            name: "x".into(),
            url: "up:3000".into(),
            key: "adb_right".into(),
        };
        assert!(matches!(f.broker.connect(bad_url).await, Err(Error::Validation(_))));

        let wrong_key = ConnectInput::Manual {
            name: "x".into(),
            url: "http://up:3000".into(),
            key: "adb_wrong".into(),
        };
        assert!(matches!(f.broker.connect(wrong_key).await, Err(Error::Auth(_))));

        let down = ConnectInput::Manual {
            name: "x".into(),
            url: "http://down:3000".into(),
            key: "adb_right".into(),
        };
        assert!(matches!(f.broker.connect(down).await, Err(Error::Unreachable(_))));

        let missing_key = ConnectInput::Manual {
            name: "x".into(),
            url: "http://up:3000".into(),
            key: " ".into(),
        };
        assert!(matches!(f.broker.connect(missing_key).await, Err(Error::Validation(_))));

        assert!(f.peers.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refuses_to_peer_with_self() {
        let f = fixture();
        let mut me = FakePeer::new("Me", "adb_k");
        me.identity.instance_id = f.identity.id();
        f.fed.add("http://me:3000", me);

        let input = ConnectInput::Manual {
            name: String::new(),
            url: "http://me:3000".into(),
            key: "adb_k".into(),
        };
        assert!(matches!(f.broker.connect(input).await, Err(Error::Validation(_))));
        assert!(f.peers.list().unwrap().is_empty());
    }
}
