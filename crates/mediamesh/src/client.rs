//! Outbound federation calls
//!
//! Everything this instance asks of a peer goes through [`FederationClient`].
//! The production implementation speaks HTTP via `reqwest`; tests substitute
//! an in-process fake.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::media::CatalogItem;

/// Header carrying the API key on every federation request
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// What a peer says about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteInstance {
    /// Permanent instance id
    pub instance_id: Uuid,
    /// Display name
    pub instance_name: String,
}

/// Address push sent to every peer when our address changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announce {
    /// Sender's instance id
    pub instance_id: Uuid,
    /// Sender's display name
    pub instance_name: String,
    /// Sender's current external URL
    pub url: String,
}

/// Gossip query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocateRequest {
    /// Instance whose address is wanted
    pub instance_id: Uuid,
}

/// An address some node confirmed at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeenAddress {
    /// Base URL
    pub url: String,
    /// When the answering node last confirmed it
    pub last_seen: DateTime<Utc>,
}

/// Gossip answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LocateResponse {
    /// The answering node knows an address
    Known(SeenAddress),
    /// The answering node has never heard of the instance
    Unknown {
        /// Always `true`
        unknown: bool,
    },
}

impl LocateResponse {
    /// The "unknown" answer
    pub fn unknown() -> Self {
        Self::Unknown { unknown: true }
    }

    /// The address, if known
    pub fn into_known(self) -> Option<SeenAddress> {
        match self {
            Self::Known(seen) => Some(seen),
            Self::Unknown { .. } => None,
        }
    }
}

/// A peer's catalog listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteLibrary {
    /// Peer's display name
    pub instance_name: String,
    /// Items the peer offers
    pub items: Vec<CatalogItem>,
}

/// Calls this instance makes to peers' federation endpoints
#[async_trait]
pub trait FederationClient: Send + Sync + 'static {
    /// `GET /federation/info`: confirms the key is accepted and returns the peer's identity
    async fn info(&self, base_url: &str, api_key: &str, timeout: Duration) -> Result<RemoteInstance>;

    /// `POST /federation/announce`
    async fn announce(
        &self,
        base_url: &str,
        api_key: &str,
        announce: &Announce,
        timeout: Duration,
    ) -> Result<()>;

    /// `POST /federation/resolve`: asks the peer where `instance_id` lives
    async fn locate(
        &self,
        base_url: &str,
        api_key: &str,
        instance_id: Uuid,
        timeout: Duration,
    ) -> Result<Option<SeenAddress>>;

    /// `GET /federation/library`
    async fn library(&self, base_url: &str, api_key: &str, timeout: Duration) -> Result<RemoteLibrary>;
}

/// URL that streams one catalog item's bytes from a peer
pub fn item_stream_url(base_url: &str, item_id: &str) -> Result<String> {
    let mut url = Url::parse(base_url)
        .map_err(|e| Error::validation(format!("invalid peer URL {base_url:?}: {e}")))?;
    url.path_segments_mut()
        .map_err(|()| Error::validation(format!("peer URL {base_url:?} cannot have a path")))?
        .pop_if_empty()
        .extend(["federation", "items", item_id, "stream"]);
    Ok(url.into())
}

/// [`FederationClient`] over HTTP
#[derive(Debug, Clone, Default)]
pub struct HttpFederationClient {
    client: reqwest::Client,
}

impl HttpFederationClient {
    /// Create a client
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(base_url: &str, path: &str) -> String {
        format!("{}/federation/{path}", base_url.trim_end_matches('/'))
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder, what: &str) -> Result<T> {
        let response = self.check(request, what).await?;
        response
            .json()
            .await
            .map_err(|e| Error::unreachable(format!("{what}: invalid response from peer: {e}")))
    }

    async fn check(&self, request: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::unreachable(format!("{what}: timed out"))
            } else {
                Error::unreachable(format!("{what}: {e}"))
            }
        })?;

        let status = response.status();
        debug!(what, status = %status, "Federation call completed");
        match status {
            s if s.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(Error::auth(format!("{what}: peer rejected the API key")))
            }
            // Every federation route exists on a live peer, so a 404 means
            // something else now answers at this address
            StatusCode::NOT_FOUND => Err(Error::unreachable(format!(
                "{what}: no federation endpoint at this address"
            ))),
            s => {
                let text = response.text().await.unwrap_or_default();
                Err(Error::unreachable(format!("{what}: peer returned {s}: {text}")))
            }
        }
    }
}

#[async_trait]
impl FederationClient for HttpFederationClient {
    async fn info(&self, base_url: &str, api_key: &str, timeout: Duration) -> Result<RemoteInstance> {
        let request = self
            .client
            .get(Self::endpoint(base_url, "info"))
            .header(API_KEY_HEADER, api_key)
            .timeout(timeout);
        self.send(request, "info").await
    }

    async fn announce(
        &self,
        base_url: &str,
        api_key: &str,
        announce: &Announce,
        timeout: Duration,
    ) -> Result<()> {
        let request = self
            .client
            .post(Self::endpoint(base_url, "announce"))
            .header(API_KEY_HEADER, api_key)
            .json(announce)
            .timeout(timeout);
        self.check(request, "announce").await.map(|_| ())
    }

    async fn locate(
        &self,
        base_url: &str,
        api_key: &str,
        instance_id: Uuid,
        timeout: Duration,
    ) -> Result<Option<SeenAddress>> {
        let request = self
            .client
            .post(Self::endpoint(base_url, "resolve"))
            .header(API_KEY_HEADER, api_key)
            .json(&LocateRequest { instance_id })
            .timeout(timeout);
        let response: LocateResponse = self.send(request, "resolve").await?;
        Ok(response.into_known())
    }

    async fn library(&self, base_url: &str, api_key: &str, timeout: Duration) -> Result<RemoteLibrary> {
        let request = self
            .client
            .get(Self::endpoint(base_url, "library"))
            .header(API_KEY_HEADER, api_key)
            .timeout(timeout);
        self.send(request, "library").await
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-process stand-in for remote instances, keyed by base URL.

    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;

    /// How a fake peer behaves
    #[derive(Debug, Clone)]
    pub(crate) struct FakePeer {
        pub identity: RemoteInstance,
        pub accepted_key: String,
        pub known: HashMap<Uuid, SeenAddress>,
        pub items: Vec<CatalogItem>,
        pub delay: Option<Duration>,
    }

    impl FakePeer {
        pub(crate) fn new(name: &str, key: &str) -> Self {
            Self {
                identity: RemoteInstance {
                    instance_id: Uuid::new_v4(),
                    instance_name: name.to_string(),
                },
                accepted_key: key.to_string(),
                known: HashMap::new(),
                items: Vec::new(),
                delay: None,
            }
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeFederation {
        pub peers: Mutex<HashMap<String, FakePeer>>,
        pub announces: Mutex<Vec<(String, Announce)>>,
        pub library_calls: Mutex<Vec<String>>,
        /// Errors handed out by the next `library` calls, before any lookup
        pub library_failures: Mutex<Vec<Error>>,
    }

    impl FakeFederation {
        pub(crate) fn add(&self, url: &str, peer: FakePeer) {
            self.peers.lock().insert(url.to_string(), peer);
        }

        pub(crate) fn remove(&self, url: &str) {
            self.peers.lock().remove(url);
        }

        async fn reach(&self, url: &str, key: &str, timeout: Duration) -> Result<FakePeer> {
            let peer = self
                .peers
                .lock()
                .get(url)
                .cloned()
                .ok_or_else(|| Error::unreachable(format!("{url}: connection refused")))?;
            if let Some(delay) = peer.delay {
                if delay >= timeout {
                    tokio::time::sleep(timeout).await;
                    return Err(Error::unreachable(format!("{url}: timed out")));
                }
                tokio::time::sleep(delay).await;
            }
            if peer.accepted_key != key {
                return Err(Error::auth("peer rejected the API key"));
            }
            Ok(peer)
        }
    }

    #[async_trait]
    impl FederationClient for FakeFederation {
        async fn info(&self, base_url: &str, api_key: &str, timeout: Duration) -> Result<RemoteInstance> {
            Ok(self.reach(base_url, api_key, timeout).await?.identity)
        }

        async fn announce(
            &self,
            base_url: &str,
            api_key: &str,
            announce: &Announce,
            timeout: Duration,
        ) -> Result<()> {
            self.reach(base_url, api_key, timeout).await?;
            self.announces
                .lock()
                .push((base_url.to_string(), announce.clone()));
            Ok(())
        }

        async fn locate(
            &self,
            base_url: &str,
            api_key: &str,
            instance_id: Uuid,
            timeout: Duration,
        ) -> Result<Option<SeenAddress>> {
            let peer = self.reach(base_url, api_key, timeout).await?;
            Ok(peer.known.get(&instance_id).cloned())
        }

        async fn library(&self, base_url: &str, api_key: &str, timeout: Duration) -> Result<RemoteLibrary> {
            self.library_calls.lock().push(base_url.to_string());
            if let Some(error) = self.library_failures.lock().pop() {
                return Err(error);
            }
            let peer = self.reach(base_url, api_key, timeout).await?;
            Ok(RemoteLibrary {
                instance_name: peer.identity.instance_name,
                items: peer.items,
            })
        }
    }
}
