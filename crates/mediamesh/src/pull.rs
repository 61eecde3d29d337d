//! Cross-instance transfers
//!
//! A pull claims `(peer, remote item)` in the transfer table with a single
//! `INSERT ... ON CONFLICT DO NOTHING` before any bytes move. Whoever inserts
//! the row owns the transfer; everyone else gets the existing download id
//! back. Retrying a pull is therefore always safe.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::params;
use serde::Serialize;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::item_stream_url;
use crate::error::{Error, Result};
use crate::media::{DownloadPipeline, LibraryMover, TransferJob};
use crate::peers::PeerDirectory;
use crate::store::{format_ts, Database};

/// Options for a single pull
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullOptions {
    /// Move the finished download into a library
    pub auto_move: bool,
    /// Target library; the default library when `None`
    pub library_id: Option<String>,
    /// Title from the peer's listing, if the caller has it
    pub title: Option<String>,
}

/// State of a pull as reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PullStatus {
    /// A new transfer was started
    Queued,
    /// The item was already transferred or is in flight
    Exists,
}

/// Result of a pull
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullOutcome {
    /// Local download id
    pub id: String,
    /// What happened
    pub status: PullStatus,
    /// Whether an earlier pull already covered this item
    pub already_exists: bool,
}

/// Executes transfers idempotently
pub struct PullCoordinator {
    db: Arc<Database>,
    peers: Arc<PeerDirectory>,
    pipeline: Arc<dyn DownloadPipeline>,
    mover: Arc<dyn LibraryMover>,
    jobs: TaskTracker,
}

impl PullCoordinator {
    /// Create a coordinator
    pub fn new(
        db: Arc<Database>,
        peers: Arc<PeerDirectory>,
        pipeline: Arc<dyn DownloadPipeline>,
        mover: Arc<dyn LibraryMover>,
    ) -> Self {
        Self {
            db,
            peers,
            pipeline,
            mover,
            jobs: TaskTracker::new(),
        }
    }

    /// Transfer `remote_item_id` from `peer_id`, unless already done
    pub async fn pull(&self, peer_id: Uuid, remote_item_id: &str, opts: PullOptions) -> Result<PullOutcome> {
        let remote_item_id = remote_item_id.trim();
        if remote_item_id.is_empty() {
            return Err(Error::validation("item id must not be empty"));
        }

        let peer = self.peers.get(peer_id)?;
        let source_url = item_stream_url(&peer.url, remote_item_id)?;

        let download_id = Uuid::new_v4().to_string();
        let claimed = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO transfers (peer_id, remote_item_id, download_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (peer_id, remote_item_id) DO NOTHING",
                params![
                    peer_id.to_string(),
                    remote_item_id,
                    download_id,
                    format_ts(&Utc::now())
                ],
            )
        })? > 0;

        if !claimed {
            let existing = self
                .existing_download(peer_id, remote_item_id)?
                .ok_or_else(|| Error::conflict("transfer record vanished during claim"))?;
            debug!(peer = %peer_id, item = remote_item_id, download = %existing, "Item already pulled");
            return Ok(PullOutcome {
                id: existing,
                status: PullStatus::Exists,
                already_exists: true,
            });
        }

        let job = TransferJob {
            download_id: download_id.clone(),
            source_url,
            api_key: peer.api_key.clone(),
            title: opts.title.clone().unwrap_or_else(|| remote_item_id.to_string()),
        };
        info!(
            peer = %peer_id,
            item = remote_item_id,
            download = %download_id,
            auto_move = opts.auto_move,
            "Pull queued"
        );

        let db = self.db.clone();
        let pipeline = self.pipeline.clone();
        let mover = self.mover.clone();
        let item = remote_item_id.to_string();
        self.jobs.spawn(async move {
            let completed = match pipeline.run(job).await {
                Ok(completed) => completed,
                Err(e) => {
                    warn!(peer = %peer_id, item = %item, error = %e, "Transfer failed, releasing claim");
                    if let Err(e) = release_claim(&db, peer_id, &item) {
                        warn!(peer = %peer_id, item = %item, error = %e, "Failed to release transfer claim");
                    }
                    return;
                }
            };
            info!(download = %completed.download_id, path = %completed.path.display(), "Transfer completed");

            if opts.auto_move {
                match mover.move_to_library(&completed, opts.library_id.as_deref()).await {
                    Ok(()) => info!(
                        download = %completed.download_id,
                        library = ?opts.library_id,
                        "Moved into library"
                    ),
                    Err(e) => warn!(download = %completed.download_id, error = %e, "Move to library failed"),
                }
            }
        });

        Ok(PullOutcome {
            id: download_id,
            status: PullStatus::Queued,
            already_exists: false,
        })
    }

    /// Remote item ids already recorded for `peer_id`
    pub fn transferred_items(&self, peer_id: Uuid) -> Result<HashSet<String>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT remote_item_id FROM transfers WHERE peer_id = ?1")?;
            let rows = stmt.query_map([peer_id.to_string()], |row| row.get(0))?;
            rows.collect()
        })
    }

    /// Wait for every transfer started so far
    pub async fn wait_idle(&self) {
        self.jobs.close();
        self.jobs.wait().await;
        self.jobs.reopen();
    }

    fn existing_download(&self, peer_id: Uuid, remote_item_id: &str) -> Result<Option<String>> {
        use rusqlite::OptionalExtension;

        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT download_id FROM transfers WHERE peer_id = ?1 AND remote_item_id = ?2",
                params![peer_id.to_string(), remote_item_id],
                |row| row.get(0),
            )
            .optional()
        })
    }
}

fn release_claim(db: &Database, peer_id: Uuid, remote_item_id: &str) -> Result<()> {
    db.with_conn(|conn| {
        conn.execute(
            "DELETE FROM transfers WHERE peer_id = ?1 AND remote_item_id = ?2",
            params![peer_id.to_string(), remote_item_id],
        )
    })?;
    Ok(())
}
