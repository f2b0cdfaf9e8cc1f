//! In-memory mirror of every document in the vault.
//!
//! The cache is keyed by [`LogicalPath`] and shared as an `Arc<DocumentCache>`
//! between the document service and the watch adapter. The lock guards only the
//! map itself; callers do their filesystem I/O before taking it.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use vault_paths::{LogicalPath, Owner};

use crate::fingerprint::Fingerprint;

/// A cached document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Document {
    #[serde(serialize_with = "serialize_relative")]
    pub path: LogicalPath,
    pub content: String,
    pub fingerprint: Fingerprint,
}

impl Document {
    pub fn new(path: LogicalPath, content: String) -> Self {
        let fingerprint = Fingerprint::of(&content);
        Self {
            path,
            content,
            fingerprint,
        }
    }
}

fn serialize_relative<S: serde::Serializer>(
    path: &LogicalPath,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(path.relative())
}

/// Thread-safe document map.
#[derive(Debug, Default)]
pub struct DocumentCache {
    documents: RwLock<HashMap<LogicalPath, Arc<Document>>>,
}

impl DocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &LogicalPath) -> Option<Arc<Document>> {
        let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        documents.get(path).cloned()
    }

    /// Insert or replace the document at `path`, returning the stored entry.
    pub fn put(&self, path: LogicalPath, content: String) -> Arc<Document> {
        let document = Arc::new(Document::new(path.clone(), content));
        let mut documents = self
            .documents
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        documents.insert(path, Arc::clone(&document));
        document
    }

    /// Drop the entry at `path`. Returns whether one was present.
    pub fn remove(&self, path: &LogicalPath) -> bool {
        let mut documents = self
            .documents
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        documents.remove(path).is_some()
    }

    /// Drop every entry below the directory `dir`. Returns how many were removed.
    pub fn remove_tree(&self, dir: &LogicalPath) -> usize {
        let prefix = format!("{}/", dir.relative());
        let mut documents = self
            .documents
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = documents.len();
        documents.retain(|path, _| {
            path.owner() != dir.owner() || !path.relative().starts_with(&prefix)
        });
        before - documents.len()
    }

    /// Re-key every entry below `from` to the same place below `to`.
    /// Returns how many entries moved.
    pub fn move_tree(&self, from: &LogicalPath, to: &LogicalPath) -> usize {
        let prefix = format!("{}/", from.relative());
        let mut documents = self
            .documents
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let moved: Vec<LogicalPath> = documents
            .keys()
            .filter(|path| path.owner() == from.owner() && path.relative().starts_with(&prefix))
            .cloned()
            .collect();

        let mut count = 0;
        for old in moved {
            let Some(document) = documents.remove(&old) else {
                continue;
            };
            let rest = &old.relative()[prefix.len()..];
            let relative = format!("{}/{}", to.relative(), rest);
            if let Ok(path) = LogicalPath::new(to.owner(), &relative) {
                let document = Document {
                    path: path.clone(),
                    content: document.content.clone(),
                    fingerprint: document.fingerprint.clone(),
                };
                documents.insert(path, Arc::new(document));
                count += 1;
            }
        }
        count
    }

    /// Point-in-time copy of one owner's documents, sorted by path.
    pub fn scan_all(&self, owner: &Owner) -> Vec<Arc<Document>> {
        let mut snapshot: Vec<_> = {
            let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
            documents
                .iter()
                .filter(|(path, _)| path.owner() == owner)
                .map(|(_, document)| Arc::clone(document))
                .collect()
        };
        snapshot.sort_by(|a, b| a.path.cmp(&b.path));
        snapshot
    }

    pub fn len(&self) -> usize {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
