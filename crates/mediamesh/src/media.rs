//! Interfaces to the rest of the media manager
//!
//! Acquisition, library storage and file organization live outside this
//! crate. The federation layer only sees them through these traits.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One entry in an instance's catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
    /// Id stable across listings
    pub id: String,
    /// Human-readable title
    pub title: String,
    /// Size in bytes, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// A catalog item resolved to local bytes
#[derive(Debug, Clone)]
pub struct ItemSource {
    /// File holding the item
    pub path: PathBuf,
    /// Size in bytes
    pub size_bytes: u64,
    /// File name to suggest to the receiver
    pub file_name: String,
}

/// This instance's catalog, as exposed to peers
#[async_trait]
pub trait Catalog: Send + Sync + 'static {
    /// List everything this instance offers
    async fn list_items(&self) -> Result<Vec<CatalogItem>>;

    /// Locate an item's bytes; `None` if the id is unknown
    async fn open_item(&self, id: &str) -> Result<Option<ItemSource>>;
}

/// A transfer handed to the download pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    /// Download id, assigned before the job starts
    pub download_id: String,
    /// URL that streams the item
    pub source_url: String,
    /// Credential for `source_url`
    pub api_key: String,
    /// Title of the remote item
    pub title: String,
}

/// What the pipeline produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedDownload {
    /// Download id the job was started with
    pub download_id: String,
    /// Where the item landed
    pub path: PathBuf,
}

/// The acquisition pipeline
#[async_trait]
pub trait DownloadPipeline: Send + Sync + 'static {
    /// Run a transfer to completion
    async fn run(&self, job: TransferJob) -> Result<CompletedDownload>;
}

/// Moves finished downloads into a library
#[async_trait]
pub trait LibraryMover: Send + Sync + 'static {
    /// Move a download into `library_id`, or the default library when `None`
    async fn move_to_library(&self, download: &CompletedDownload, library_id: Option<&str>) -> Result<()>;
}
