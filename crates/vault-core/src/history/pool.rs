//! Lazily opened version stores, one per owner.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::info;
use vault_paths::Owner;

use super::{HistoryError, Result, VersionStore};

/// File name of an owner's history database inside its internal area.
pub const HISTORY_DB_FILE: &str = "versions.db";

/// Keeps one long-lived [`VersionStore`] per owner for the life of the process.
pub struct HistoryPool {
    root: PathBuf,
    stores: Mutex<HashMap<Owner, Arc<VersionStore>>>,
}

impl HistoryPool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Database location for `owner`.
    pub fn db_path(&self, owner: &Owner) -> PathBuf {
        owner.internal_dir(&self.root).join(HISTORY_DB_FILE)
    }

    /// The store of `owner`, opening it on first use.
    ///
    /// The database is opened without holding the pool lock; if two callers race on
    /// the same owner, the first handle inserted wins and the other is dropped.
    pub fn store(&self, owner: &Owner) -> Result<Arc<VersionStore>> {
        if let Some(store) = self.lock()?.get(owner) {
            return Ok(Arc::clone(store));
        }

        let opened = Arc::new(VersionStore::open(self.db_path(owner))?);
        let mut stores = self.lock()?;
        let store = stores.entry(owner.clone()).or_insert_with(|| {
            info!("Opened version history for {} at {:?}", owner, opened.path());
            Arc::clone(&opened)
        });
        Ok(Arc::clone(store))
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Owner, Arc<VersionStore>>>> {
        self.stores
            .lock()
            .map_err(|_| HistoryError::StorageUnavailable("store pool lock poisoned".to_string()))
    }

    /// Number of stores currently open.
    pub fn open_count(&self) -> usize {
        self.stores.lock().map(|stores| stores.len()).unwrap_or(0)
    }
}
