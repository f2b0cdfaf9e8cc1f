//! Per-owner patch-chain version history.
//!
//! Every API-mediated change to a document appends one [`VersionRecord`] to the
//! chain for that document's owner-relative path. Records are either full
//! snapshots or deltas against the previous record; a full snapshot is forced on
//! the first record and every [`FULL_SNAPSHOT_INTERVAL`]th one, so rebuilding any
//! version needs at most `FULL_SNAPSHOT_INTERVAL - 1` patch applications.
//!
//! - [`VersionStore`]: one SQLite database per owner (`<owner>/.extra/versions.db`)
//! - [`HistoryPool`]: long-lived store handles, opened lazily per owner

mod pool;
mod record;
mod store;

pub use pool::{HistoryPool, HISTORY_DB_FILE};
pub use record::{decode_id, encode_id, RecordId, RecordKind, VersionRecord, VersionSummary};
pub use store::{Reconstruction, VersionStore};

use thiserror::Error;

use crate::patch::PatchError;

/// A full snapshot is stored at every position that is a multiple of this.
pub const FULL_SNAPSHOT_INTERVAL: u64 = 50;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("History storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("No version {id} in history of {path}")]
    NoSuchVersion { path: String, id: RecordId },

    #[error("Corrupt history for {path}: {reason}")]
    CorruptHistory { path: String, reason: String },

    #[error("Version {id} of {path} does not apply: {source}")]
    MalformedPatch {
        path: String,
        id: RecordId,
        #[source]
        source: PatchError,
    },
}

impl From<rusqlite::Error> for HistoryError {
    fn from(e: rusqlite::Error) -> Self {
        HistoryError::StorageUnavailable(e.to_string())
    }
}

impl From<std::io::Error> for HistoryError {
    fn from(e: std::io::Error) -> Self {
        HistoryError::StorageUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HistoryError>;

/// Kind of the record that will sit at 1-indexed `position` in a chain.
///
/// The first record has no predecessor to diff against, so it is always full.
pub fn kind_for_position(position: u64) -> RecordKind {
    if position <= 1 || position % FULL_SNAPSHOT_INTERVAL == 0 {
        RecordKind::Full
    } else {
        RecordKind::Delta
    }
}
