//! Gossip address resolution
//!
//! When a peer's stored address stops working, every *other* peer is asked
//! whether it has a fresher address for that peer's instance id. Only
//! addresses some node has itself confirmed are propagated, and only when
//! their timestamp beats ours.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{FederationClient, LocateResponse, SeenAddress};
use crate::error::{Error, Result};
use crate::peers::PeerDirectory;
use crate::token::normalize_url;

/// Result of a resolve attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolveOutcome {
    /// Whether the peer's address was updated
    pub resolved: bool,
    /// Name of the peer that supplied the address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
}

impl ResolveOutcome {
    fn unresolved() -> Self {
        Self {
            resolved: false,
            via: None,
        }
    }
}

/// Repairs stale peer addresses by asking the rest of the mesh
pub struct GossipResolver {
    peers: Arc<PeerDirectory>,
    client: Arc<dyn FederationClient>,
    query_timeout: Duration,
    deadline: Duration,
}

impl GossipResolver {
    /// Create a resolver
    pub fn new(
        peers: Arc<PeerDirectory>,
        client: Arc<dyn FederationClient>,
        query_timeout: Duration,
        deadline: Duration,
    ) -> Self {
        Self {
            peers,
            client,
            query_timeout,
            deadline,
        }
    }

    /// Ask every other peer for a fresher address of `peer_id`
    pub async fn resolve(&self, peer_id: Uuid) -> Result<ResolveOutcome> {
        let target = self.peers.get(peer_id)?;
        let instance_id = target.remote_instance_id.ok_or_else(|| {
            Error::not_resolvable(format!("peer {peer_id} has never reported its instance id"))
        })?;

        let witnesses: Vec<_> = self
            .peers
            .list()?
            .into_iter()
            .filter(|p| p.id != peer_id && p.remote_instance_id != Some(instance_id))
            .collect();
        if witnesses.is_empty() {
            debug!(peer = %peer_id, "No other peers to ask");
            return Ok(ResolveOutcome::unresolved());
        }

        let asked = witnesses.len();
        let mut queries = JoinSet::new();
        for witness in witnesses {
            let client = self.client.clone();
            let timeout = self.query_timeout;
            queries.spawn(async move {
                let answer = tokio::time::timeout(
                    timeout,
                    client.locate(&witness.url, &witness.api_key, instance_id, timeout),
                )
                .await;
                match answer {
                    Ok(Ok(Some(seen))) => Some((witness.name, seen)),
                    Ok(Ok(None)) => None,
                    Ok(Err(e)) => {
                        debug!(witness = %witness.name, error = %e, "Gossip query failed");
                        None
                    }
                    Err(_) => {
                        debug!(witness = %witness.name, "Gossip query timed out");
                        None
                    }
                }
            });
        }

        let answers = collect_until(&mut queries, Instant::now() + self.deadline).await;
        debug!(peer = %peer_id, asked, answered = answers.len(), "Gossip fan-out finished");

        let best = answers
            .into_iter()
            .filter_map(|(via, seen)| match normalize_url(&seen.url) {
                Ok(url) => Some((via, SeenAddress { url, ..seen })),
                Err(e) => {
                    warn!(witness = %via, error = %e, "Discarding malformed gossip address");
                    None
                }
            })
            .max_by_key(|(_, seen)| seen.last_seen);

        let Some((via, seen)) = best else {
            info!(peer = %peer_id, "No peer knows a fresher address");
            return Ok(ResolveOutcome::unresolved());
        };

        // The conditional update is the freshness check; it also matches
        // nothing if the peer was deleted while we waited.
        let applied = self
            .peers
            .apply_resolved_address(peer_id, instance_id, &seen.url, seen.last_seen)?;
        if !applied {
            info!(peer = %peer_id, via = %via, "Gossip answer was not fresher than stored address");
            return Ok(ResolveOutcome::unresolved());
        }

        info!(peer = %peer_id, url = %seen.url, via = %via, "Peer address resolved via gossip");
        Ok(ResolveOutcome {
            resolved: true,
            via: Some(via),
        })
    }

    /// Answer another instance asking where `instance_id` lives
    pub fn answer(&self, instance_id: Uuid) -> Result<LocateResponse> {
        let known = self.peers.find_by_instance(instance_id)?.and_then(|peer| {
            peer.last_seen.map(|last_seen| SeenAddress {
                url: peer.url,
                last_seen,
            })
        });
        Ok(known.map_or_else(LocateResponse::unknown, LocateResponse::Known))
    }
}

/// Drain `set` until it is empty or `deadline` passes; stragglers are aborted
async fn collect_until<T: 'static>(set: &mut JoinSet<Option<T>>, deadline: Instant) -> Vec<T> {
    let mut results = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, set.join_next()).await {
            Ok(Some(Ok(Some(value)))) => results.push(value),
            Ok(Some(Ok(None))) => {}
            Ok(Some(Err(e))) => warn!(error = %e, "Gossip query task failed"),
            Ok(None) => break,
            Err(_) => {
                debug!(pending = set.len(), "Gossip deadline reached");
                set.abort_all();
                break;
            }
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration as ChronoDuration, Utc};

    use super::*;
    use crate::client::fake::{FakeFederation, FakePeer};
    use crate::peers::tests::verified;
    use crate::peers::Peer;
    use crate::store::Database;

    struct Fixture {
        resolver: GossipResolver,
        peers: Arc<PeerDirectory>,
        fed: Arc<FakeFederation>,
        db: Arc<Database>,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let peers = Arc::new(PeerDirectory::new(db.clone()));
        let fed = Arc::new(FakeFederation::default());
        let resolver = GossipResolver::new(
            peers.clone(),
            fed.clone(),
            Duration::from_millis(200),
            Duration::from_millis(500),
        );
        Fixture {
            resolver,
            peers,
            fed,
            db,
        }
    }

    fn add_peer(f: &Fixture, name: &str, url: &str, seen: DateTime<Utc>) -> Peer {
        f.peers
            .upsert_verified(verified(name, url, Uuid::new_v4()), seen)
            .unwrap()
            .peer
    }

    /// A witness that reports `seen` for `instance`
    fn witness(f: &Fixture, name: &str, url: &str, instance: Uuid, seen: Option<SeenAddress>) {
        let mut fake = FakePeer::new(name, "adb_test");
        if let Some(seen) = seen {
            fake.known.insert(instance, seen);
        }
        f.fed.add(url, fake);
        add_peer(f, name, url, Utc::now());
    }

    #[tokio::test]
    async fn test_freshest_answer_wins() {
        let f = fixture();
        let t0 = Utc::now() - ChronoDuration::minutes(10);
        let target = add_peer(&f, "Target", "http://stale:1", t0);
        let instance = target.remote_instance_id.unwrap();

        witness(&f, "Older", "http://w1:1", instance, Some(SeenAddress {
            url: "http://older:1".into(),
            last_seen: t0 + ChronoDuration::minutes(1),
        }));
        witness(&f, "Newer", "http://w2:1", instance, Some(SeenAddress {
            url: "http://newer:1/".into(),
            last_seen: t0 + ChronoDuration::minutes(5),
        }));
        witness(&f, "Clueless", "http://w3:1", instance, None);

        let outcome = f.resolver.resolve(target.id).await.unwrap();
        assert_eq!(
            outcome,
            ResolveOutcome {
                resolved: true,
                via: Some("Newer".into())
            }
        );
        assert_eq!(f.peers.get(target.id).unwrap().url, "http://newer:1");
    }

    #[tokio::test]
    async fn test_never_overwrites_with_older_or_equal_timestamp() {
        let f = fixture();
        let t0 = Utc::now();
        let target = add_peer(&f, "Target", "http://current:1", t0);
        let instance = target.remote_instance_id.unwrap();

        witness(&f, "Equal", "http://w1:1", instance, Some(SeenAddress {
            url: "http://equal:1".into(),
            last_seen: t0,
        }));
        witness(&f, "Older", "http://w2:1", instance, Some(SeenAddress {
            url: "http://older:1".into(),
            last_seen: t0 - ChronoDuration::seconds(30),
        }));

        let outcome = f.resolver.resolve(target.id).await.unwrap();
        assert!(!outcome.resolved);
        assert_eq!(f.peers.get(target.id).unwrap().url, "http://current:1");
    }

    #[tokio::test]
    async fn test_unknown_everywhere_leaves_peer_unchanged() {
        let f = fixture();
        let target = add_peer(&f, "Target", "http://current:1", Utc::now());
        let instance = target.remote_instance_id.unwrap();
        witness(&f, "A", "http://w1:1", instance, None);
        witness(&f, "B", "http://w2:1", instance, None);

        let outcome = f.resolver.resolve(target.id).await.unwrap();
        assert_eq!(outcome, ResolveOutcome::unresolved());
        assert_eq!(f.peers.get(target.id).unwrap(), target);
    }

    #[tokio::test]
    async fn test_deadline_uses_partial_results() {
        let f = fixture();
        let t0 = Utc::now() - ChronoDuration::minutes(10);
        let target = add_peer(&f, "Target", "http://stale:1", t0);
        let instance = target.remote_instance_id.unwrap();

        witness(&f, "Fast", "http://fast:1", instance, Some(SeenAddress {
            url: "http://fast-answer:1".into(),
            last_seen: t0 + ChronoDuration::minutes(1),
        }));
        // Slow witness never answers inside the per-query timeout
        let mut slow = FakePeer::new("Slow", "adb_test");
        slow.delay = Some(Duration::from_secs(30));
        slow.known.insert(instance, SeenAddress {
            url: "http://slow-answer:1".into(),
            last_seen: t0 + ChronoDuration::minutes(9),
        });
        f.fed.add("http://slow:1", slow);
        add_peer(&f, "Slow", "http://slow:1", Utc::now());

        let started = std::time::Instant::now();
        let outcome = f.resolver.resolve(target.id).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(outcome.via.as_deref(), Some("Fast"));
        assert_eq!(f.peers.get(target.id).unwrap().url, "http://fast-answer:1");
    }

    #[tokio::test]
    async fn test_unknown_peer_and_missing_identity() {
        let f = fixture();
        assert!(matches!(
            f.resolver.resolve(Uuid::new_v4()).await,
            Err(Error::NotFound(_))
        ));

        // The broker never stores a peer without an instance id, so write one directly
        let id = Uuid::new_v4();
        f.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO peers (id, name, url, api_key, created_at)
                 VALUES (?1, 'Legacy', 'http://legacy:1', 'adb_test', '2026-01-01T00:00:00.000000Z')",
                [id.to_string()],
            )
        })
        .unwrap();
        assert!(matches!(
            f.resolver.resolve(id).await,
            Err(Error::NotResolvable(_))
        ));
    }

    #[test]
    fn test_answer_reports_known_address() {
        let f = fixture();
        let seen = Utc::now();
        let peer = add_peer(&f, "A", "http://a:1", seen);
        let instance = peer.remote_instance_id.unwrap();

        match f.resolver.answer(instance).unwrap() {
            LocateResponse::Known(addr) => {
                assert_eq!(addr.url, "http://a:1");
                assert_eq!(addr.last_seen, peer.last_seen.unwrap());
            }
            other => panic!("unexpected answer {other:?}"),
        }
        assert_eq!(
            f.resolver.answer(Uuid::new_v4()).unwrap(),
            LocateResponse::unknown()
        );
    }
}
