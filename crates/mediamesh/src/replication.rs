//! Replication scheduling
//!
//! Every peer with `auto_replicate` set gets its own long-lived task. The
//! task wakes on the sync interval, lists the peer's catalog and pulls
//! whatever has no transfer record yet. Each cycle runs in a spawned task of
//! its own so a panic ends the cycle, not the loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::FederationClient;
use crate::error::{Error, Result};
use crate::gossip::GossipResolver;
use crate::peers::PeerDirectory;
use crate::pull::{PullCoordinator, PullOptions, PullStatus};

/// Counts from one replication cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplicationSummary {
    /// Pulls started
    pub queued: usize,
    /// Items already transferred or in flight
    pub skipped: usize,
    /// Items in the peer's catalog
    pub total: usize,
}

struct PeerTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// One cycle's worth of collaborators, shared by every peer task
struct Replicator {
    peers: Arc<PeerDirectory>,
    client: Arc<dyn FederationClient>,
    pulls: Arc<PullCoordinator>,
    resolver: Arc<GossipResolver>,
    interval: Duration,
    timeout: Duration,
}

/// Owns the per-peer replication tasks
pub struct ReplicationScheduler {
    replicator: Arc<Replicator>,
    tasks: Mutex<HashMap<Uuid, PeerTask>>,
    root: CancellationToken,
}

impl ReplicationScheduler {
    /// Create a scheduler; no tasks run until [`enable`](Self::enable) or
    /// [`reconcile`](Self::reconcile)
    pub fn new(
        peers: Arc<PeerDirectory>,
        client: Arc<dyn FederationClient>,
        pulls: Arc<PullCoordinator>,
        resolver: Arc<GossipResolver>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            replicator: Arc::new(Replicator {
                peers,
                client,
                pulls,
                resolver,
                interval,
                timeout,
            }),
            tasks: Mutex::new(HashMap::new()),
            root: CancellationToken::new(),
        }
    }

    /// Start the task for `peer_id` unless one is already running
    pub fn enable(&self, peer_id: Uuid) {
        if self.root.is_cancelled() {
            debug!(peer = %peer_id, "Scheduler shut down, not starting task");
            return;
        }

        let mut tasks = self.tasks.lock();
        if tasks.get(&peer_id).is_some_and(|t| !t.handle.is_finished()) {
            return;
        }

        let cancel = self.root.child_token();
        let handle = tokio::spawn(peer_loop(self.replicator.clone(), peer_id, cancel.clone()));
        tasks.insert(peer_id, PeerTask { cancel, handle });
        info!(peer = %peer_id, interval_secs = self.replicator.interval.as_secs(), "Replication enabled");
    }

    /// Stop the task for `peer_id`, if any
    pub fn disable(&self, peer_id: Uuid) {
        if let Some(task) = self.tasks.lock().remove(&peer_id) {
            task.cancel.cancel();
            info!(peer = %peer_id, "Replication disabled");
        }
    }

    /// Make the running tasks match the peers' `auto_replicate` flags.
    ///
    /// Returns the number of peers replicating afterwards.
    pub fn reconcile(&self) -> Result<usize> {
        let peers = self.replicator.peers.list()?;
        let wanted: Vec<Uuid> = peers
            .iter()
            .filter(|p| p.auto_replicate)
            .map(|p| p.id)
            .collect();

        let stale: Vec<Uuid> = self
            .tasks
            .lock()
            .keys()
            .filter(|id| !wanted.contains(id))
            .copied()
            .collect();
        for id in stale {
            self.disable(id);
        }
        for &id in &wanted {
            self.enable(id);
        }

        debug!(count = wanted.len(), "Replication tasks reconciled");
        Ok(wanted.len())
    }

    /// Whether a task is currently running for `peer_id`
    pub fn is_running(&self, peer_id: Uuid) -> bool {
        self.tasks
            .lock()
            .get(&peer_id)
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Run one cycle now, targeting `library_id` or the peer's sync library
    pub async fn replicate_now(&self, peer_id: Uuid, library_id: Option<String>) -> Result<ReplicationSummary> {
        let cancel = self.root.child_token();
        self.replicator
            .cycle(peer_id, library_id, false, &cancel)
            .await?
            .ok_or_else(|| Error::not_found(format!("peer {peer_id}")))
    }

    /// Cancel every task and wait for them to stop
    pub async fn shutdown(&self) {
        self.root.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain().collect();
        for (peer_id, task) in tasks {
            if let Err(e) = task.handle.await {
                warn!(peer = %peer_id, error = %e, "Replication task ended abnormally");
            }
        }
        info!("Replication scheduler stopped");
    }
}

async fn peer_loop(replicator: Arc<Replicator>, peer_id: Uuid, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(replicator.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let mut cycle = tokio::spawn({
            let replicator = replicator.clone();
            let cancel = cancel.clone();
            async move { replicator.cycle(peer_id, None, true, &cancel).await }
        });

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                cycle.abort();
                break;
            }
            outcome = &mut cycle => outcome,
        };

        match outcome {
            Ok(Ok(Some(summary))) => debug!(
                peer = %peer_id,
                queued = summary.queued,
                skipped = summary.skipped,
                total = summary.total,
                "Replication cycle finished"
            ),
            Ok(Ok(None)) => {
                info!(peer = %peer_id, "Peer removed or no longer replicating, stopping");
                break;
            }
            Ok(Err(e)) if e.is_unreachable() => {
                warn!(peer = %peer_id, error = %e, "Peer unreachable, trying gossip");
                replicator.repair(peer_id).await;
            }
            Ok(Err(e)) => warn!(peer = %peer_id, error = %e, "Replication cycle failed"),
            Err(e) if e.is_panic() => error!(peer = %peer_id, "Replication cycle panicked"),
            Err(_) => break,
        }
    }

    debug!(peer = %peer_id, "Replication task stopped");
}

impl Replicator {
    /// One pass over the peer's catalog.
    ///
    /// `Ok(None)` means the peer is gone, or (for scheduled cycles) no longer
    /// replicating.
    async fn cycle(
        &self,
        peer_id: Uuid,
        library_override: Option<String>,
        scheduled: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<ReplicationSummary>> {
        let peer = match self.peers.get(peer_id) {
            Ok(peer) => peer,
            Err(Error::NotFound(_)) if scheduled => return Ok(None),
            Err(e) => return Err(e),
        };
        if scheduled && !peer.auto_replicate {
            return Ok(None);
        }

        let library = self.client.library(&peer.url, &peer.api_key, self.timeout).await?;
        self.peers.confirm_seen(peer_id, &peer.url, Utc::now())?;

        let transferred = self.pulls.transferred_items(peer_id)?;
        let library_id = library_override.or(peer.sync_library_id);
        let mut summary = ReplicationSummary {
            total: library.items.len(),
            ..Default::default()
        };

        for item in library.items {
            if transferred.contains(&item.id) {
                summary.skipped += 1;
                continue;
            }
            if cancel.is_cancelled() {
                debug!(peer = %peer_id, "Cycle cancelled before enqueue");
                return Ok(None);
            }

            let outcome = self
                .pulls
                .pull(
                    peer_id,
                    &item.id,
                    PullOptions {
                        auto_move: true,
                        library_id: library_id.clone(),
                        title: Some(item.title),
                    },
                )
                .await?;
            match outcome.status {
                PullStatus::Queued => summary.queued += 1,
                PullStatus::Exists => summary.skipped += 1,
            }
        }

        if summary.queued > 0 {
            info!(
                peer = %peer_id,
                name = %peer.name,
                queued = summary.queued,
                total = summary.total,
                "Replication queued new items"
            );
        }
        Ok(Some(summary))
    }

    async fn repair(&self, peer_id: Uuid) {
        match self.resolver.resolve(peer_id).await {
            Ok(outcome) if outcome.resolved => {
                info!(peer = %peer_id, via = ?outcome.via, "Address repaired, next cycle uses it");
            }
            Ok(_) => debug!(peer = %peer_id, "Gossip found no fresher address"),
            Err(e) => debug!(peer = %peer_id, error = %e, "Gossip resolve skipped"),
        }
    }
}
