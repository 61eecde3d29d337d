//! Address announcements
//!
//! Outbound: whenever our external URL becomes known or changes, every peer
//! with a known instance id is told about it. Calls run concurrently, each
//! bounded by a timeout. Failures are logged and not retried; gossip repairs
//! whatever an unreachable peer missed.
//!
//! Inbound: an announce from a known instance updates that peer's address if
//! it is fresher than what we have.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{Announce, FederationClient};
use crate::error::Result;
use crate::identity::IdentityStore;
use crate::peers::PeerDirectory;
use crate::token::normalize_url;

/// Outcome of one announce batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnounceSummary {
    /// Peers an announce was sent to
    pub attempted: usize,
    /// Peers that accepted it
    pub delivered: usize,
}

/// Sends and receives announces
pub struct AnnouncePublisher {
    identity: Arc<IdentityStore>,
    peers: Arc<PeerDirectory>,
    client: Arc<dyn FederationClient>,
    timeout: Duration,
}

impl AnnouncePublisher {
    /// Create a publisher
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

    /// Tell every identified peer that we now live at `url`
    pub async fn announce_all(&self, url: &str) -> AnnounceSummary {
        let peers = match self.peers.list() {
            Ok(peers) => peers,
            Err(e) => {
                warn!(error = %e, "Cannot list peers for announce");
                return AnnounceSummary::default();
            }
        };

        let identity = self.identity.get();
        let announce = Announce {
            instance_id: identity.id,
            instance_name: identity.name,
            url: url.to_string(),
        };

        let mut calls = JoinSet::new();
        for peer in peers.into_iter().filter(|p| p.remote_instance_id.is_some()) {
            let client = self.client.clone();
            let announce = announce.clone();
            let timeout = self.timeout;
            calls.spawn(async move {
                let sent = tokio::time::timeout(
                    timeout,
                    client.announce(&peer.url, &peer.api_key, &announce, timeout),
                )
                .await;
                match sent {
                    Ok(Ok(())) => {
                        debug!(peer = %peer.id, url = %peer.url, "Announce delivered");
                        true
                    }
                    Ok(Err(e)) => {
                        warn!(peer = %peer.id, name = %peer.name, error = %e, "Announce failed");
                        false
                    }
                    Err(_) => {
                        warn!(peer = %peer.id, name = %peer.name, "Announce timed out");
                        false
                    }
                }
            });
        }

        let mut summary = AnnounceSummary::default();
        while let Some(joined) = calls.join_next().await {
            summary.attempted += 1;
            match joined {
                Ok(true) => summary.delivered += 1,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Announce task failed"),
            }
        }

        info!(
            url,
            attempted = summary.attempted,
            delivered = summary.delivered,
            "Announce batch finished"
        );
        summary
    }

    /// Announce on every change of `external_url`, including its current value
    pub fn spawn_on_change(
        self: Arc<Self>,
        mut external_url: watch::Receiver<Option<String>>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let current = external_url.borrow_and_update().clone();
                match current {
                    Some(url) => {
                        self.announce_all(&url).await;
                    }
                    None => debug!("External URL unknown, nothing to announce"),
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = external_url.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Announce watcher stopped");
        })
    }

    /// Apply an announce received from a peer.
    ///
    /// Returns whether a stored address changed.
    pub fn receive(&self, announce: &Announce) -> Result<bool> {
        let url = normalize_url(&announce.url)?;
        if announce.instance_id == self.identity.id() {
            debug!("Ignoring announce carrying our own instance id");
            return Ok(false);
        }

        let name = announce.instance_name.trim();
        let name = (!name.is_empty()).then_some(name);
        let applied = self
            .peers
            .apply_announced_address(announce.instance_id, name, &url, Utc::now())?;
        if applied {
            info!(instance = %announce.instance_id, url = %url, "Peer address updated from announce");
        }
        Ok(applied)
    }
}
