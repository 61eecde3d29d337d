//! Peer directory
//!
//! The authoritative local record of other instances this one is linked to.
//! Rows are created only by the connection broker. Address fields are only
//! ever rewritten through freshness-conditional updates: an incoming address
//! wins when its timestamp is strictly newer than the stored `last_seen`,
//! regardless of the order updates arrive in.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::{format_ts, parse_ts, parse_uuid, Database};

const PEER_COLUMNS: &str = "id, name, url, api_key, remote_instance_id, last_seen,
                            auto_replicate, sync_library_id, created_at";

/// A linked instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    /// Local id of this record
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// Base URL (scheme, host, port), no trailing slash
    pub url: String,
    /// Credential this instance presents when calling the peer
    #[serde(skip_serializing)]
    pub api_key: String,
    /// The peer's own instance id, immutable once known
    pub remote_instance_id: Option<Uuid>,
    /// When `url` was last confirmed fresh
    pub last_seen: Option<DateTime<Utc>>,
    /// Whether the replication scheduler polls this peer
    pub auto_replicate: bool,
    /// Local library new items are moved into
    pub sync_library_id: Option<String>,
    /// When the record was created
    pub created_at: DateTime<Utc>,
}

/// Operator-editable peer fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerPreferences {
    /// New auto-replicate flag
    pub auto_replicate: Option<bool>,
    /// New sync library; `Some(None)` clears it
    pub sync_library_id: Option<Option<String>>,
}

/// Fields the broker has verified against the remote instance
#[derive(Debug, Clone)]
pub struct VerifiedPeer {
    /// Display name
    pub name: String,
    /// Normalized base URL
    pub url: String,
    /// Credential accepted by the remote
    pub api_key: String,
    /// Instance id the remote reported
    pub remote_instance_id: Uuid,
}

/// Result of an upsert
#[derive(Debug, Clone)]
pub struct Upserted {
    /// The stored peer
    pub peer: Peer,
    /// Whether a new row was created
    pub created: bool,
}

/// Local record of known peers
pub struct PeerDirectory {
    db: Arc<Database>,
}

impl PeerDirectory {
    /// Create a directory over the shared database
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// All peers, oldest first
    pub fn list(&self) -> Result<Vec<Peer>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PEER_COLUMNS} FROM peers ORDER BY created_at, rowid"
            ))?;
            let rows = stmt.query_map([], peer_from_row)?;
            rows.collect()
        })
    }

    /// Look up a peer by local id
    pub fn get(&self, id: Uuid) -> Result<Peer> {
        self.db
            .with_conn(|conn| select_by(conn, "id", &id.to_string()))?
            .ok_or_else(|| Error::not_found(format!("peer {id}")))
    }

    /// Look up a peer by the remote instance's id
    pub fn find_by_instance(&self, remote_instance_id: Uuid) -> Result<Option<Peer>> {
        self.db.with_conn(|conn| {
            select_by(conn, "remote_instance_id", &remote_instance_id.to_string())
        })
    }

    /// Insert or update a peer keyed by its remote instance id.
    ///
    /// An existing row keeps its local id, preferences and creation time; its
    /// name, url and key are replaced and `last_seen` moves to `seen_at`.
    pub fn upsert_verified(&self, verified: VerifiedPeer, seen_at: DateTime<Utc>) -> Result<Upserted> {
        let remote_id = verified.remote_instance_id.to_string();
        let seen = format_ts(&seen_at);

        let (peer, created) = self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let existing = select_by(&tx, "remote_instance_id", &remote_id)?;
            let (id, created) = match existing {
                Some(existing) => {
                    tx.execute(
                        "UPDATE peers SET name = ?1, url = ?2, api_key = ?3, last_seen = ?4
                         WHERE id = ?5",
                        params![
                            verified.name,
                            verified.url,
                            verified.api_key,
                            seen,
                            existing.id.to_string()
                        ],
                    )?;
                    (existing.id, false)
                }
                None => {
                    let id = Uuid::new_v4();
                    tx.execute(
                        "INSERT INTO peers (id, name, url, api_key, remote_instance_id, last_seen,
                                            auto_replicate, sync_library_id, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, NULL, ?7)",
                        params![
                            id.to_string(),
                            verified.name,
                            verified.url,
                            verified.api_key,
                            remote_id,
                            seen,
                            format_ts(&Utc::now())
                        ],
                    )?;
                    (id, true)
                }
            };
            let peer = select_by(&tx, "id", &id.to_string())?
                .ok_or(rusqlite::Error::QueryReturnedNoRows)?;
            tx.commit()?;
            Ok((peer, created))
        })?;

        info!(peer = %peer.id, name = %peer.name, url = %peer.url, created, "Peer saved");
        Ok(Upserted { peer, created })
    }

    /// Apply an address heard from the instance itself (an announce).
    ///
    /// Returns whether the stored address changed. Unknown instance ids are
    /// ignored.
    pub fn apply_announced_address(
        &self,
        remote_instance_id: Uuid,
        name: Option<&str>,
        url: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<bool> {
        let applied = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE peers SET url = ?1, last_seen = ?2, name = COALESCE(?3, name)
                 WHERE remote_instance_id = ?4 AND (last_seen IS NULL OR last_seen < ?2)",
                params![url, format_ts(&seen_at), name, remote_instance_id.to_string()],
            )
        })? > 0;

        debug!(instance = %remote_instance_id, url, applied, "Announced address processed");
        Ok(applied)
    }

    /// Apply an address vouched for by a third party (a gossip answer).
    ///
    /// The update targets the row by local id *and* instance id, so a result
    /// for a peer deleted in the meantime matches nothing and is discarded.
    pub fn apply_resolved_address(
        &self,
        peer_id: Uuid,
        remote_instance_id: Uuid,
        url: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<bool> {
        let applied = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE peers SET url = ?1, last_seen = ?2
                 WHERE id = ?3 AND remote_instance_id = ?4
                   AND (last_seen IS NULL OR last_seen < ?2)",
                params![
                    url,
                    format_ts(&seen_at),
                    peer_id.to_string(),
                    remote_instance_id.to_string()
                ],
            )
        })? > 0;

        debug!(peer = %peer_id, url, applied, "Resolved address processed");
        Ok(applied)
    }

    /// Record that the peer answered at its current address.
    ///
    /// Only moves `last_seen` forward, and only if `url` is still the stored
    /// address.
    pub fn confirm_seen(&self, peer_id: Uuid, url: &str, seen_at: DateTime<Utc>) -> Result<bool> {
        let touched = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE peers SET last_seen = ?1
                 WHERE id = ?2 AND url = ?3 AND (last_seen IS NULL OR last_seen < ?1)",
                params![format_ts(&seen_at), peer_id.to_string(), url],
            )
        })? > 0;
        Ok(touched)
    }

    /// Change operator preferences
    pub fn set_preferences(&self, id: Uuid, prefs: &PeerPreferences) -> Result<Peer> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            if let Some(auto) = prefs.auto_replicate {
                tx.execute(
                    "UPDATE peers SET auto_replicate = ?1 WHERE id = ?2",
                    params![auto, id.to_string()],
                )?;
            }
            if let Some(library) = &prefs.sync_library_id {
                tx.execute(
                    "UPDATE peers SET sync_library_id = ?1 WHERE id = ?2",
                    params![library, id.to_string()],
                )?;
            }
            tx.commit()
        })?;

        let peer = self.get(id)?;
        info!(
            peer = %id,
            auto_replicate = peer.auto_replicate,
            sync_library_id = ?peer.sync_library_id,
            "Peer preferences updated"
        );
        Ok(peer)
    }

    /// Delete a peer and its transfer records. Local effect only.
    pub fn delete(&self, id: Uuid) -> Result<()> {
        let removed = self
            .db
            .with_conn(|conn| conn.execute("DELETE FROM peers WHERE id = ?1", [id.to_string()]))?;
        if removed == 0 {
            return Err(Error::not_found(format!("peer {id}")));
        }
        info!(peer = %id, "Peer deleted");
        Ok(())
    }
}

fn select_by(conn: &Connection, column: &str, value: &str) -> rusqlite::Result<Option<Peer>> {
    conn.query_row(
        &format!("SELECT {PEER_COLUMNS} FROM peers WHERE {column} = ?1"),
        [value],
        peer_from_row,
    )
    .optional()
}

fn peer_from_row(row: &Row<'_>) -> rusqlite::Result<Peer> {
    let id: String = row.get(0)?;
    let remote_instance_id: Option<String> = row.get(4)?;
    let last_seen: Option<String> = row.get(5)?;
    let created_at: String = row.get(8)?;

    Ok(Peer {
        id: parse_uuid(&id)?,
        name: row.get(1)?,
        url: row.get(2)?,
        api_key: row.get(3)?,
        remote_instance_id: remote_instance_id.as_deref().map(parse_uuid).transpose()?,
        last_seen: last_seen.as_deref().map(parse_ts).transpose()?,
        auto_replicate: row.get(6)?,
        sync_library_id: row.get(7)?,
        created_at: parse_ts(&created_at)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;

    pub(crate) fn verified(name: &str, url: &str, instance: Uuid) -> VerifiedPeer {
        VerifiedPeer {
            name: name.to_string(),
            url: url.to_string(),
            api_key: "adb_test".to_string(),
            remote_instance_id: instance,
        }
    }

    fn directory() -> PeerDirectory {
        PeerDirectory::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    #[test]
    fn test_upsert_by_instance_id_does_not_duplicate() {
        let peers = directory();
        let instance = Uuid::new_v4();

        let first = peers
            .upsert_verified(verified("Node", "http://1.1.1.1:3000", instance), Utc::now())
            .unwrap();
        assert!(first.created);

        peers
            .set_preferences(
                first.peer.id,
                &PeerPreferences {
                    auto_replicate: Some(true),
                    sync_library_id: Some(Some("movies".into())),
                },
            )
            .unwrap();

        let second = peers
            .upsert_verified(verified("Node 2", "http://2.2.2.2:3000", instance), Utc::now())
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.peer.id, first.peer.id);
        assert_eq!(second.peer.url, "http://2.2.2.2:3000");
        assert_eq!(second.peer.name, "Node 2");
        // Preferences survive a reconnect
        assert!(second.peer.auto_replicate);
        assert_eq!(second.peer.sync_library_id.as_deref(), Some("movies"));

        assert_eq!(peers.list().unwrap().len(), 1);
    }

    #[test]
    fn test_announced_address_requires_newer_timestamp() {
        let peers = directory();
        let instance = Uuid::new_v4();
        let t0 = Utc::now();
        peers
            .upsert_verified(verified("Node", "http://old:3000", instance), t0)
            .unwrap();

        // Older announce loses
        let stale = t0 - Duration::seconds(5);
        assert!(!peers
            .apply_announced_address(instance, None, "http://stale:3000", stale)
            .unwrap());
        // Equal timestamp loses too
        assert!(!peers
            .apply_announced_address(instance, None, "http://same:3000", t0)
            .unwrap());

        let fresh = t0 + Duration::seconds(5);
        assert!(peers
            .apply_announced_address(instance, Some("Renamed"), "http://new:3000", fresh)
            .unwrap());

        let peer = peers.find_by_instance(instance).unwrap().unwrap();
        assert_eq!(peer.url, "http://new:3000");
        assert_eq!(peer.name, "Renamed");
        assert_eq!(
            peer.last_seen.map(|t| format_ts(&t)),
            Some(format_ts(&fresh))
        );
    }

    #[test]
    fn test_unknown_instance_announce_is_ignored() {
        let peers = directory();
        assert!(!peers
            .apply_announced_address(Uuid::new_v4(), None, "http://x:1", Utc::now())
            .unwrap());
    }

    #[test]
    fn test_resolved_address_discarded_after_delete() {
        let peers = directory();
        let instance = Uuid::new_v4();
        let t0 = Utc::now();
        let peer = peers
            .upsert_verified(verified("Node", "http://old:3000", instance), t0)
            .unwrap()
            .peer;

        peers.delete(peer.id).unwrap();
        assert!(!peers
            .apply_resolved_address(peer.id, instance, "http://new:3000", t0 + Duration::seconds(1))
            .unwrap());
        assert!(matches!(peers.get(peer.id), Err(Error::NotFound(_))));
        assert!(matches!(peers.delete(peer.id), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_confirm_seen_only_for_current_url() {
        let peers = directory();
        let t0 = Utc::now();
        let peer = peers
            .upsert_verified(verified("Node", "http://a:1", Uuid::new_v4()), t0)
            .unwrap()
            .peer;

        assert!(!peers
            .confirm_seen(peer.id, "http://b:1", t0 + Duration::seconds(1))
            .unwrap());
        assert!(peers
            .confirm_seen(peer.id, "http://a:1", t0 + Duration::seconds(1))
            .unwrap());
    }

    #[test]
    fn test_clear_sync_library() {
        let peers = directory();
        let peer = peers
            .upsert_verified(verified("Node", "http://a:1", Uuid::new_v4()), Utc::now())
            .unwrap()
            .peer;

        peers
            .set_preferences(
                peer.id,
                &PeerPreferences {
                    sync_library_id: Some(Some("tv".into())),
                    ..Default::default()
                },
            )
            .unwrap();
        let cleared = peers
            .set_preferences(
                peer.id,
                &PeerPreferences {
                    sync_library_id: Some(None),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(cleared.sync_library_id, None);
        assert!(!cleared.auto_replicate);
    }

    #[test]
    fn test_serialized_peer_hides_api_key() {
        let peers = directory();
        let peer = peers
            .upsert_verified(verified("Node", "http://a:1", Uuid::new_v4()), Utc::now())
            .unwrap()
            .peer;

        let json = serde_json::to_value(&peer).unwrap();
        assert!(json.get("apiKey").is_none());
        assert_eq!(json["name"], "Node");
        assert!(json["remoteInstanceId"].is_string());
    }
}
