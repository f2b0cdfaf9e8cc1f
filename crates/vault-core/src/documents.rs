//! Document and directory operations: write/read/delete/rename, history, search and listing.
//!
//! A write updates disk first, then the cache, then appends a version record.
//! The first two are part of the request; a failed history append is logged and
//! the write still succeeds.

use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use vault_paths::{is_markdown, resolve, Owner, ResolvedPath, ATTACHMENT_SUFFIX};

use crate::cache::{Document, DocumentCache};
use crate::error::{Result, VaultError};
use crate::fingerprint::Fingerprint;
use crate::fs::{Disk, DiskEntry, DiskError};
use crate::history::{HistoryPool, RecordId, VersionSummary};
use crate::search::{self, SearchHit};

/// Recycle bin inside an owner's internal area.
pub const RECYCLE_DIR: &str = ".recycle";

/// What a write did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WriteOutcome {
    /// Content identical to the current state; nothing was touched.
    Unchanged { fingerprint: Fingerprint },
    /// New document; no history is recorded for creation.
    Created { fingerprint: Fingerprint },
    /// Existing document replaced. `version` is `None` if recording history failed.
    Updated {
        fingerprint: Fingerprint,
        version: Option<RecordId>,
    },
}

impl WriteOutcome {
    pub fn fingerprint(&self) -> &Fingerprint {
        match self {
            WriteOutcome::Unchanged { fingerprint }
            | WriteOutcome::Created { fingerprint }
            | WriteOutcome::Updated { fingerprint, .. } => fingerprint,
        }
    }
}

/// One entry of a directory listing. Internal areas and hidden entries are never listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListItem {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    /// Files in the document's `.attach` directory (markdown files only)
    #[serde(skip_serializing_if = "is_zero")]
    pub attach_count: usize,
    /// Directory contents, present for directories of a recursive listing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<ListItem>>,
}

fn is_zero(count: &usize) -> bool {
    *count == 0
}

type ListFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<ListItem>>> + Send + 'a>>;

/// Entry point for every document operation of the vault.
pub struct DocumentService<D: Disk> {
    root: PathBuf,
    disk: D,
    cache: Arc<DocumentCache>,
    history: Arc<HistoryPool>,
}

impl<D: Disk> DocumentService<D> {
    pub fn new(
        root: impl Into<PathBuf>,
        disk: D,
        cache: Arc<DocumentCache>,
        history: Arc<HistoryPool>,
    ) -> Self {
        Self {
            root: root.into(),
            disk,
            cache,
            history,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache(&self) -> &Arc<DocumentCache> {
        &self.cache
    }

    pub fn history_pool(&self) -> &Arc<HistoryPool> {
        &self.history
    }

    fn resolve(&self, owner: &str, path: &str) -> Result<ResolvedPath> {
        resolve(&self.root, owner, path).map_err(|e| VaultError::from_path_error(path, e))
    }

    fn resolve_markdown(&self, owner: &str, path: &str) -> Result<ResolvedPath> {
        let resolved = self.resolve(owner, path)?;
        if !resolved.logical.is_markdown() {
            return Err(VaultError::invalid_path(path, "file must have a .md extension"));
        }
        Ok(resolved)
    }

    /// Current state of a document: the cache first, then disk.
    async fn current(&self, resolved: &ResolvedPath) -> Result<Option<Arc<Document>>> {
        if let Some(doc) = self.cache.get(&resolved.logical) {
            return Ok(Some(doc));
        }
        match self.disk.read(&resolved.absolute).await {
            Ok(bytes) => {
                let content = String::from_utf8(bytes)
                    .map_err(|_| VaultError::NotText(resolved.logical.to_string()))?;
                Ok(Some(Arc::new(Document::new(
                    resolved.logical.clone(),
                    content,
                ))))
            }
            Err(DiskError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write `content` to the markdown document at `path`.
    pub async fn write(
        &self,
        owner: &str,
        path: &str,
        content: &str,
        comment: &str,
    ) -> Result<WriteOutcome> {
        let resolved = self.resolve_markdown(owner, path)?;
        let previous = self.current(&resolved).await?;
        let fingerprint = Fingerprint::of(content);

        if let Some(previous) = &previous {
            if previous.fingerprint == fingerprint {
                return Ok(WriteOutcome::Unchanged { fingerprint });
            }
        }

        self.disk.write(&resolved.absolute, content.as_bytes()).await?;
        let stored = self
            .cache
            .put(resolved.logical.clone(), content.to_string());

        let Some(previous) = previous else {
            info!("Created {}", resolved.logical);
            return Ok(WriteOutcome::Created { fingerprint });
        };

        let version = self.record_version(&resolved, previous, stored, comment).await;
        info!("Updated {}", resolved.logical);
        Ok(WriteOutcome::Updated {
            fingerprint,
            version,
        })
    }

    /// Append a history record for a completed write. Failures are logged only.
    async fn record_version(
        &self,
        resolved: &ResolvedPath,
        previous: Arc<Document>,
        current: Arc<Document>,
        comment: &str,
    ) -> Option<RecordId> {
        let history = Arc::clone(&self.history);
        let owner = resolved.logical.owner().clone();
        let key = resolved.logical.relative().to_string();
        let comment = comment.to_string();

        let result = tokio::task::spawn_blocking(move || {
            history.store(&owner)?.append(
                &key,
                &previous.fingerprint,
                &current.fingerprint,
                &previous.content,
                &current.content,
                &comment,
            )
        })
        .await;

        match result {
            Ok(Ok(id)) => Some(id),
            Ok(Err(e)) => {
                error!("Failed to record version of {}: {}", resolved.logical, e);
                None
            }
            Err(e) => {
                error!("Version recording task for {} failed: {}", resolved.logical, e);
                None
            }
        }
    }

    /// Read a document, from the cache when possible.
    pub async fn read(&self, owner: &str, path: &str) -> Result<Arc<Document>> {
        let resolved = self.resolve(owner, path)?;
        self.current(&resolved)
            .await?
            .ok_or_else(|| VaultError::NotFound(resolved.logical.to_string()))
    }

    /// Move a document to the owner's recycle bin and drop its attachments.
    ///
    /// Returns where the file was recycled to, or `None` if it had to be removed
    /// outright. History is kept.
    pub async fn delete(&self, owner: &str, path: &str) -> Result<Option<PathBuf>> {
        let resolved = self.resolve(owner, path)?;
        let fingerprint = match self.disk.read(&resolved.absolute).await {
            Ok(bytes) => Fingerprint::of_bytes(&bytes),
            Err(DiskError::NotFound(_)) => {
                self.cache.remove(&resolved.logical);
                return Err(VaultError::NotFound(resolved.logical.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let recycled = resolved
            .logical
            .owner()
            .internal_dir(&self.root)
            .join(RECYCLE_DIR)
            .join(fingerprint.as_str())
            .join(resolved.logical.file_name());

        let recycled = match self.disk.rename(&resolved.absolute, &recycled).await {
            Ok(()) => Some(recycled),
            Err(e) => {
                warn!(
                    "Failed to recycle {}, removing instead: {}",
                    resolved.logical, e
                );
                self.disk.remove(&resolved.absolute).await?;
                None
            }
        };

        let attachments = attachment_dir(&resolved.absolute);
        if self.disk.exists(&attachments).await? {
            self.disk.remove(&attachments).await?;
        }

        self.cache.remove(&resolved.logical);
        info!("Deleted {}", resolved.logical);
        Ok(recycled)
    }

    /// Rename a document together with its attachments. History stays with the old path.
    pub async fn rename(&self, owner: &str, from: &str, to: &str) -> Result<()> {
        let source = self.resolve(owner, from)?;
        let target = self.resolve_markdown(owner, to)?;

        match self.disk.rename(&source.absolute, &target.absolute).await {
            Ok(()) => {}
            Err(DiskError::NotFound(_)) => {
                return Err(VaultError::NotFound(source.logical.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let source_attachments = attachment_dir(&source.absolute);
        if self.disk.exists(&source_attachments).await? {
            self.disk
                .rename(&source_attachments, &attachment_dir(&target.absolute))
                .await?;
        }

        self.cache.remove(&source.logical);
        match self.disk.read(&target.absolute).await {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(content) => {
                    self.cache.put(target.logical.clone(), content);
                }
                Err(_) => warn!("Renamed {} is not valid UTF-8, not cached", target.logical),
            },
            Err(e) => warn!("Failed to re-read renamed {}: {}", target.logical, e),
        }

        info!("Renamed {} to {}", source.logical, target.logical);
        Ok(())
    }

    /// Create a directory (and missing parents) below the owner directory.
    pub async fn create_dir(&self, owner: &str, path: &str) -> Result<()> {
        let resolved = self.resolve(owner, path)?;
        self.disk.create_dir(&resolved.absolute).await?;
        info!("Created directory {}", resolved.logical);
        Ok(())
    }

    /// Remove a directory with everything in it. Cached documents below it are dropped;
    /// their history is kept.
    pub async fn delete_dir(&self, owner: &str, path: &str) -> Result<()> {
        let resolved = self.resolve(owner, path)?;
        match self.disk.remove(&resolved.absolute).await {
            Ok(()) => {}
            Err(DiskError::NotFound(_)) => {
                return Err(VaultError::NotFound(resolved.logical.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let dropped = self.cache.remove_tree(&resolved.logical);
        self.cache.remove(&resolved.logical);
        info!(
            "Deleted directory {} ({} cached documents dropped)",
            resolved.logical, dropped
        );
        Ok(())
    }

    /// Move a directory. Cached documents below it are re-keyed to the new location;
    /// history stays with the old paths.
    pub async fn rename_dir(&self, owner: &str, from: &str, to: &str) -> Result<()> {
        let source = self.resolve(owner, from)?;
        let target = self.resolve(owner, to)?;

        match self.disk.rename(&source.absolute, &target.absolute).await {
            Ok(()) => {}
            Err(DiskError::NotFound(_)) => {
                return Err(VaultError::NotFound(source.logical.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let moved = self.cache.move_tree(&source.logical, &target.logical);
        info!(
            "Renamed directory {} to {} ({} cached documents moved)",
            source.logical, target.logical, moved
        );
        Ok(())
    }

    /// List a directory of the owner. An empty `path` lists the owner directory itself.
    pub async fn list(&self, owner: &str, path: &str, recursive: bool) -> Result<Vec<ListItem>> {
        let dir = if path.trim_matches('/').is_empty() {
            Owner::new(owner)
                .map_err(|e| VaultError::invalid_path(owner, e))?
                .dir(&self.root)
        } else {
            self.resolve(owner, path)?.absolute
        };

        match self.list_dir(dir, recursive).await {
            Err(VaultError::Disk(DiskError::NotFound(_))) => {
                Err(VaultError::NotFound(format!("{}/{}", owner, path.trim_matches('/'))))
            }
            result => result,
        }
    }

    fn list_dir(&self, dir: PathBuf, recursive: bool) -> ListFuture<'_> {
        Box::pin(async move {
            let mut items = Vec::new();
            for entry in self.disk.list(&dir).await? {
                if !is_listed(&entry) {
                    continue;
                }
                let path = dir.join(&entry.name);
                let attach_count = if !entry.is_dir && is_markdown(&entry.name) {
                    match self.disk.list(&attachment_dir(&path)).await {
                        Ok(attachments) => attachments.len(),
                        Err(DiskError::NotFound(_)) => 0,
                        Err(e) => return Err(e.into()),
                    }
                } else {
                    0
                };
                let children = if entry.is_dir && recursive {
                    Some(self.list_dir(path, true).await?)
                } else {
                    None
                };
                items.push(ListItem {
                    name: entry.name,
                    is_dir: entry.is_dir,
                    size: entry.size,
                    modified: entry.modified,
                    attach_count,
                    children,
                });
            }
            Ok(items)
        })
    }

    /// Version history of a document, newest first.
    pub async fn history(&self, owner: &str, path: &str) -> Result<Vec<VersionSummary>> {
        let resolved = self.resolve(owner, path)?;
        let history = Arc::clone(&self.history);
        let owner = resolved.logical.owner().clone();
        let key = resolved.logical.relative().to_string();

        let summaries =
            tokio::task::spawn_blocking(move || history.store(&owner)?.list(&key)).await??;
        Ok(summaries)
    }

    /// Content of a document as of version `id`.
    pub async fn version(&self, owner: &str, path: &str, id: RecordId) -> Result<String> {
        let resolved = self.resolve(owner, path)?;
        let history = Arc::clone(&self.history);
        let owner = resolved.logical.owner().clone();
        let key = resolved.logical.relative().to_string();

        let content =
            tokio::task::spawn_blocking(move || history.store(&owner)?.materialize(&key, id))
                .await??;
        Ok(content)
    }

    /// Search one owner's cached documents.
    pub fn search(&self, owner: &str, query: &str, regex: bool) -> Result<Vec<SearchHit>> {
        let owner = Owner::new(owner).map_err(|e| VaultError::invalid_path(owner, e))?;
        let documents = self.cache.scan_all(&owner);
        Ok(search::search(
            documents.iter().map(|doc| doc.as_ref()),
            query,
            regex,
        ))
    }
}

/// Whether a directory entry is visible to clients.
fn is_listed(entry: &DiskEntry) -> bool {
    !entry.name.starts_with('.') && !entry.name.ends_with(ATTACHMENT_SUFFIX)
}

/// `<file>.attach` next to a document.
fn attachment_dir(document: &Path) -> PathBuf {
    let mut name = OsString::from(document.as_os_str());
    name.push(ATTACHMENT_SUFFIX);
    PathBuf::from(name)
}
