//! Directory-backed media collaborators
//!
//! Lets the server run standalone: a directory of files is the catalog,
//! transfers stream into a downloads directory, and libraries are folders.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use mediamesh::media::{Catalog, CatalogItem, CompletedDownload, DownloadPipeline, ItemSource, LibraryMover, TransferJob};
use mediamesh::{Error, Result, API_KEY_HEADER};
use reqwest::header::CONTENT_DISPOSITION;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Library used when a move names none
pub const DEFAULT_LIBRARY: &str = "default";

fn io_error(what: &str, path: &Path, e: std::io::Error) -> Error {
    Error::storage(format!("{what} {}: {e}", path.display()))
}

/// Every regular file under a directory, identified by its relative path
#[derive(Debug, Clone)]
pub struct FsCatalog {
    root: PathBuf,
}

impl FsCatalog {
    /// Serve the files under `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map an item id back to a path inside the root, refusing escapes
    fn resolve(&self, id: &str) -> Option<PathBuf> {
        let relative = Path::new(id);
        let safe = !id.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        safe.then(|| self.root.join(relative))
    }
}

#[async_trait]
impl Catalog for FsCatalog {
    async fn list_items(&self) -> Result<Vec<CatalogItem>> {
        let mut items = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error("failed to read", &dir, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_error("failed to read", &dir, e))?
            {
                let path = entry.path();
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| io_error("failed to stat", &path, e))?;
                if meta.is_dir() {
                    pending.push(path);
                    continue;
                }
                if !meta.is_file() {
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let id = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let title = path
                    .file_stem()
                    .map_or_else(|| id.clone(), |s| s.to_string_lossy().into_owned());
                items.push(CatalogItem {
                    id,
                    title,
                    size_bytes: Some(meta.len()),
                });
            }
        }

        items.sort_by(|a, b| a.id.cmp(&b.id));
        debug!(root = %self.root.display(), count = items.len(), "Catalog listed");
        Ok(items)
    }

    async fn open_item(&self, id: &str) -> Result<Option<ItemSource>> {
        let Some(path) = self.resolve(id) else {
            return Ok(None);
        };
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("failed to stat", &path, e)),
        };
        let file_name = path
            .file_name()
            .map_or_else(|| id.to_string(), |n| n.to_string_lossy().into_owned());
        Ok(Some(ItemSource {
            path,
            size_bytes: meta.len(),
            file_name,
        }))
    }
}

/// Streams items from peers into `{downloads}/{download_id}/`
#[derive(Debug, Clone)]
pub struct HttpDownloadPipeline {
    client: reqwest::Client,
    downloads: PathBuf,
}

impl HttpDownloadPipeline {
    /// Download into `downloads`
    pub fn new(downloads: impl Into<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::new(),
            downloads: downloads.into(),
        }
    }
}

#[async_trait]
impl DownloadPipeline for HttpDownloadPipeline {
    async fn run(&self, job: TransferJob) -> Result<CompletedDownload> {
        let mut response = self
            .client
            .get(&job.source_url)
            .header(API_KEY_HEADER, &job.api_key)
            .send()
            .await
            .map_err(|e| Error::unreachable(format!("{}: {e}", job.source_url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(match status.as_u16() {
                401 | 403 => Error::auth("peer rejected the API key"),
                404 => Error::not_found(format!("item no longer offered at {}", job.source_url)),
                _ => Error::unreachable(format!("{}: peer returned {status}", job.source_url)),
            });
        }

        let file_name = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(disposition_filename)
            .unwrap_or_else(|| sanitize(&job.title));

        let dir = self.downloads.join(&job.download_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("failed to create", &dir, e))?;
        let final_path = dir.join(&file_name);
        let partial = dir.join(format!("{file_name}.part"));

        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| io_error("failed to create", &partial, e))?;
        let mut written: u64 = 0;
        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_dir_all(&dir).await;
                    return Err(Error::unreachable(format!("transfer interrupted: {e}")));
                }
            };
            file.write_all(&chunk)
                .await
                .map_err(|e| io_error("failed to write", &partial, e))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| io_error("failed to write", &partial, e))?;
        drop(file);

        tokio::fs::rename(&partial, &final_path)
            .await
            .map_err(|e| io_error("failed to finalize", &final_path, e))?;

        info!(download = %job.download_id, path = %final_path.display(), bytes = written, "Download finished");
        Ok(CompletedDownload {
            download_id: job.download_id,
            path: final_path,
        })
    }
}

/// Pull `filename` out of a `Content-Disposition` value
fn disposition_filename(value: &str) -> Option<String> {
    value
        .split(';')
        .filter_map(|part| part.trim().strip_prefix("filename="))
        .map(|name| sanitize(name.trim_matches('"')))
        .find(|name| !name.is_empty())
}

/// Make a string safe to use as a single path component
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}

/// Libraries are directories under a common root
#[derive(Debug, Clone)]
pub struct FsLibraryMover {
    root: PathBuf,
}

impl FsLibraryMover {
    /// Keep libraries under `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl LibraryMover for FsLibraryMover {
    async fn move_to_library(&self, download: &CompletedDownload, library_id: Option<&str>) -> Result<()> {
        let library = library_id.unwrap_or(DEFAULT_LIBRARY);
        if sanitize(library) != library {
            return Err(Error::validation(format!("invalid library id {library:?}")));
        }

        let file_name = download
            .path
            .file_name()
            .ok_or_else(|| Error::validation(format!("download {} has no file", download.download_id)))?;
        let dir = self.root.join(library);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("failed to create", &dir, e))?;
        let target = dir.join(file_name);

        if tokio::fs::rename(&download.path, &target).await.is_err() {
            // Different filesystem; copy then remove
            tokio::fs::copy(&download.path, &target)
                .await
                .map_err(|e| io_error("failed to copy", &target, e))?;
            if let Err(e) = tokio::fs::remove_file(&download.path).await {
                warn!(path = %download.path.display(), error = %e, "Failed to remove moved download");
            }
        }

        if let Some(parent) = download.path.parent() {
            // Only succeeds once the per-download directory is empty
            let _ = tokio::fs::remove_dir(parent).await;
        }
        info!(download = %download.download_id, library, path = %target.display(), "Moved into library");
        Ok(())
    }
}
