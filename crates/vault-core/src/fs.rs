//! Disk abstraction used by the document service.
//!
//! Implementations:
//! - `NativeDisk` - tokio::fs with temp-file + rename writes
//! - `InMemoryDisk` - for testing (explicit directories tracked alongside files)

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DiskError {
    fn from_io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            DiskError::NotFound(path.to_path_buf())
        } else {
            DiskError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, DiskError>;

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskEntry {
    pub name: String,
    pub is_dir: bool,
    /// File size in bytes; 0 for directories
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Filesystem operations over absolute paths.
#[async_trait]
pub trait Disk: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Replace file contents atomically (creates parent directories if needed)
    async fn write(&self, path: &Path, content: &[u8]) -> Result<()>;

    /// Delete a file, or a directory with everything in it
    async fn remove(&self, path: &Path) -> Result<()>;

    /// Move a file or directory (creates the destination's parents if needed)
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Create a directory and any missing parents
    async fn create_dir(&self, path: &Path) -> Result<()>;

    /// Direct children of a directory, sorted by name
    async fn list(&self, path: &Path) -> Result<Vec<DiskEntry>>;
}

/// Real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeDisk;

impl NativeDisk {
    pub fn new() -> Self {
        Self
    }

    fn random_hex() -> String {
        let bytes: [u8; 8] = rand::rng().random();
        hex::encode(bytes)
    }

    async fn create_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DiskError::from_io(parent, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Disk for NativeDisk {
    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).await.map_err(|e| DiskError::from_io(path, e))
    }

    async fn write(&self, path: &Path, content: &[u8]) -> Result<()> {
        Self::create_parent(path).await?;

        // Temp name ends in .tmp so watchers ignore it until the rename.
        let temp_path = path.with_extension(format!("{}.tmp", Self::random_hex()));
        if let Err(e) = fs::write(&temp_path, content).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(DiskError::from_io(&temp_path, e));
        }
        if let Err(e) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(DiskError::from_io(path, e));
        }
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let metadata = fs::metadata(path)
            .await
            .map_err(|e| DiskError::from_io(path, e))?;
        let result = if metadata.is_dir() {
            fs::remove_dir_all(path).await
        } else {
            fs::remove_file(path).await
        };
        result.map_err(|e| DiskError::from_io(path, e))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        Self::create_parent(to).await?;
        fs::rename(from, to)
            .await
            .map_err(|e| DiskError::from_io(from, e))
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        fs::try_exists(path)
            .await
            .map_err(|e| DiskError::from_io(path, e))
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .await
            .map_err(|e| DiskError::from_io(path, e))
    }

    async fn list(&self, path: &Path) -> Result<Vec<DiskEntry>> {
        let mut dir = fs::read_dir(path)
            .await
            .map_err(|e| DiskError::from_io(path, e))?;
        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| DiskError::from_io(path, e))?
        {
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                // Removed between read_dir and stat.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(DiskError::from_io(&entry.path(), e)),
            };
            entries.push(DiskEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

/// In-memory disk for testing. Directories exist while they hold files or after
/// an explicit `create_dir`.
#[derive(Debug, Default)]
pub struct InMemoryDisk {
    files: RwLock<HashMap<PathBuf, Vec<u8>>>,
    dirs: RwLock<HashSet<PathBuf>>,
}

impl InMemoryDisk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Paths of all stored files, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        let mut paths: Vec<_> = files.keys().cloned().collect();
        paths.sort();
        paths
    }
}

#[async_trait]
impl Disk for InMemoryDisk {
    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        files
            .get(path)
            .cloned()
            .ok_or_else(|| DiskError::NotFound(path.to_path_buf()))
    }

    async fn write(&self, path: &Path, content: &[u8]) -> Result<()> {
        let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
        files.insert(path.to_path_buf(), content.to_vec());
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
        let mut dirs = self.dirs.write().unwrap_or_else(PoisonError::into_inner);
        let before = files.len() + dirs.len();
        files.retain(|file, _| !file.starts_with(path));
        dirs.retain(|dir| !dir.starts_with(path));
        if files.len() + dirs.len() == before {
            return Err(DiskError::NotFound(path.to_path_buf()));
        }
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
        let mut dirs = self.dirs.write().unwrap_or_else(PoisonError::into_inner);
        let moved: Vec<PathBuf> = files
            .keys()
            .filter(|file| file.starts_with(from))
            .cloned()
            .collect();
        let moved_dirs: Vec<PathBuf> = dirs
            .iter()
            .filter(|dir| dir.starts_with(from))
            .cloned()
            .collect();
        if moved.is_empty() && moved_dirs.is_empty() {
            return Err(DiskError::NotFound(from.to_path_buf()));
        }
        for old in moved {
            if let Some(content) = files.remove(&old) {
                files.insert(relocate(&old, from, to), content);
            }
        }
        for old in moved_dirs {
            dirs.remove(&old);
            dirs.insert(relocate(&old, from, to));
        }
        Ok(())
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        let dirs = self.dirs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(files.keys().any(|file| file.starts_with(path))
            || dirs.iter().any(|dir| dir.starts_with(path)))
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        let mut dirs = self.dirs.write().unwrap_or_else(PoisonError::into_inner);
        dirs.insert(path.to_path_buf());
        Ok(())
    }

    async fn list(&self, path: &Path) -> Result<Vec<DiskEntry>> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        let dirs = self.dirs.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: BTreeMap<String, DiskEntry> = BTreeMap::new();
        let mut found = dirs.contains(path);

        let children = files
            .iter()
            .map(|(file, content)| (file, Some(content.len() as u64)))
            .chain(dirs.iter().map(|dir| (dir, None)));
        for (child, size) in children {
            let Ok(rest) = child.strip_prefix(path) else {
                continue;
            };
            let mut components = rest.components();
            let Some(first) = components.next() else {
                continue;
            };
            found = true;
            let name = first.as_os_str().to_string_lossy().into_owned();
            let is_dir = size.is_none() || components.next().is_some();
            entries.entry(name.clone()).or_insert(DiskEntry {
                name,
                is_dir,
                size: if is_dir { 0 } else { size.unwrap_or(0) },
                modified: None,
            });
        }

        if !found {
            return Err(DiskError::NotFound(path.to_path_buf()));
        }
        Ok(entries.into_values().collect())
    }
}

/// `path` moved from below `from` to below `to`.
fn relocate(path: &Path, from: &Path, to: &Path) -> PathBuf {
    match path.strip_prefix(from) {
        Ok(rest) if !rest.as_os_str().is_empty() => to.join(rest),
        _ => to.to_path_buf(),
    }
}
