//! vault-core: document cache, watch adapter and version history for a markdown vault.
//!
//! This crate provides:
//! - Content fingerprints and a text patch codec
//! - Per-owner patch-chain version history on SQLite
//! - An in-memory document cache kept in line with disk by a filesystem watcher
//! - The document and directory operations (write/read/delete/rename/history/search/list)
//!   tying them together

pub mod cache;
pub mod documents;
pub mod error;
pub mod fingerprint;
pub mod fs;
pub mod history;
pub mod patch;
pub mod search;
pub mod watcher;

pub use cache::{Document, DocumentCache};
pub use documents::{DocumentService, ListItem, WriteOutcome, RECYCLE_DIR};
pub use error::{Result, VaultError};
pub use fingerprint::Fingerprint;
pub use fs::{Disk, DiskEntry, DiskError, InMemoryDisk, NativeDisk};
pub use history::{
    HistoryError, HistoryPool, Reconstruction, RecordId, RecordKind, VersionRecord,
    VersionStore, VersionSummary, FULL_SNAPSHOT_INTERVAL,
};
pub use patch::{PatchError, PatchOp, PatchScript};
pub use search::SearchHit;
pub use watcher::{WatchAdapter, WatchError, WatchEvent, WatchEventKind};
