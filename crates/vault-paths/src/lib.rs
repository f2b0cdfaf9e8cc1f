//! Owner-scoped path handling for vault documents.
//!
//! Every document lives under `<root>/<owner>/<relative path>`. Callers hand us an
//! owner identity and an untrusted relative path; we hand back a traversal-free
//! [`LogicalPath`] (the key used by the document cache and the version store) and
//! the absolute location on disk. Pure functions, no I/O.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Per-owner bookkeeping directory (history database, recycle bin).
pub const INTERNAL_DIR: &str = ".extra";

/// Suffix of per-document attachment containers (`note.md.attach/`).
pub const ATTACHMENT_SUFFIX: &str = ".attach";

/// Extension of documents managed by the vault.
pub const MARKDOWN_EXTENSION: &str = "md";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("Invalid owner '{0}'")]
    InvalidOwner(String),

    #[error("Path is empty")]
    Empty,

    #[error("Path contains directory traversal")]
    DirectoryTraversal,

    #[error("Path points into an internal area")]
    InternalArea,

    #[error("Path has a hidden component")]
    Hidden,
}

/// An owner identity: the namespace that scopes documents and history.
///
/// Owners map 1:1 onto top-level directories of the vault root, so they must be
/// a single, non-hidden path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Owner(String);

impl Owner {
    pub fn new(owner: &str) -> Result<Self, PathError> {
        let trimmed = owner.trim();
        let invalid = trimmed.is_empty()
            || trimmed.starts_with('.')
            || trimmed.contains('/')
            || trimmed.contains('\\');
        if invalid {
            return Err(PathError::InvalidOwner(owner.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The owner's directory under the vault root.
    pub fn dir(&self, root: &Path) -> PathBuf {
        root.join(&self.0)
    }

    /// The owner's bookkeeping directory (`<root>/<owner>/.extra`).
    pub fn internal_dir(&self, root: &Path) -> PathBuf {
        self.dir(root).join(INTERNAL_DIR)
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated, owner-relative document path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalPath {
    owner: Owner,
    relative: String,
}

impl LogicalPath {
    /// Validate `relative` and bind it to `owner`.
    pub fn new(owner: &Owner, relative: &str) -> Result<Self, PathError> {
        let relative = normalize_relative(relative)?;
        if is_internal(&relative) {
            return Err(PathError::InternalArea);
        }
        if is_hidden(&relative) {
            return Err(PathError::Hidden);
        }
        Ok(Self {
            owner: owner.clone(),
            relative,
        })
    }

    /// Resolve an absolute filesystem path back to a logical path.
    ///
    /// Returns `None` when the path is outside `root`, is the owner directory
    /// itself, is not valid UTF-8, or points into an internal area.
    pub fn from_absolute(root: &Path, absolute: &Path) -> Option<Self> {
        let rel = absolute.strip_prefix(root).ok()?;
        let mut parts = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?),
                _ => return None,
            }
        }
        let (owner, rest) = parts.split_first()?;
        if rest.is_empty() {
            return None;
        }
        let owner = Owner::new(owner).ok()?;
        Self::new(&owner, &rest.join("/")).ok()
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    /// Slash-separated path relative to the owner directory.
    pub fn relative(&self) -> &str {
        &self.relative
    }

    /// Last path component.
    pub fn file_name(&self) -> &str {
        self.relative
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative)
    }

    pub fn is_markdown(&self) -> bool {
        is_markdown(&self.relative)
    }

    /// Absolute location of this document under `root`.
    pub fn to_path(&self, root: &Path) -> PathBuf {
        let mut path = self.owner.dir(root);
        for part in self.relative.split('/') {
            path.push(part);
        }
        path
    }
}

impl fmt::Display for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.relative)
    }
}

/// A caller-supplied path after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub logical: LogicalPath,
    pub absolute: PathBuf,
}

/// Validate an owner + relative path pair and locate it under `root`.
pub fn resolve(root: &Path, owner: &str, relative: &str) -> Result<ResolvedPath, PathError> {
    let owner = Owner::new(owner)?;
    let logical = LogicalPath::new(&owner, relative)?;
    let absolute = logical.to_path(root);
    Ok(ResolvedPath { logical, absolute })
}

/// Normalize a relative path: unify separators, drop empty and `.` components,
/// reject `..`.
pub fn normalize_relative(path: &str) -> Result<String, PathError> {
    let unified = path.replace('\\', "/");
    let mut parts = Vec::new();
    for component in unified.split('/') {
        match component {
            "" | "." => continue,
            ".." => return Err(PathError::DirectoryTraversal),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(parts.join("/"))
}

/// Whether a slash-separated relative path touches bookkeeping or attachment areas.
pub fn is_internal(relative: &str) -> bool {
    relative
        .split('/')
        .any(|part| part == INTERNAL_DIR || part.ends_with(ATTACHMENT_SUFFIX))
}

/// Whether any component of a slash-separated relative path starts with a dot.
pub fn is_hidden(relative: &str) -> bool {
    relative.split('/').any(|part| part.starts_with('.'))
}

/// Same check as [`is_internal`] for filesystem paths.
pub fn is_internal_path(path: &Path) -> bool {
    path.components().any(|c| match c {
        Component::Normal(part) => {
            let part = part.to_string_lossy();
            part == INTERNAL_DIR || part.ends_with(ATTACHMENT_SUFFIX)
        }
        _ => false,
    })
}

/// Case-insensitive `.md` check.
pub fn is_markdown(path: &str) -> bool {
    path.rsplit_once('.')
        .map(|(stem, ext)| !stem.is_empty() && ext.eq_ignore_ascii_case(MARKDOWN_EXTENSION))
        .unwrap_or(false)
}
