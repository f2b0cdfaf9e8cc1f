//! SQLite-backed version store for one owner.
//!
//! Layout:
//! - `chains(path, next_seq, created_at)`: one row per sub-chain; `next_seq` is the
//!   id the next record of that chain receives, so ids are never reused
//! - `versions(path, seq, record)`: records keyed by `(path, seq)` where `seq` is the
//!   big-endian id and `record` is the JSON-encoded [`VersionRecord`]
//!
//! Writes go through a single connection behind a mutex and run as immediate
//! transactions, so one owner has at most one committing writer. Reads open their
//! own read-only connection and see a consistent WAL snapshot.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use tracing::{debug, warn};

use super::record::{decode_id, encode_id, RecordId, RecordKind, VersionRecord, VersionSummary};
use super::{kind_for_position, HistoryError, Result};
use crate::fingerprint::Fingerprint;
use crate::patch;

const SCHEMA: &str = r#"
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=NORMAL;

    CREATE TABLE IF NOT EXISTS chains (
      path TEXT PRIMARY KEY,
      next_seq INTEGER NOT NULL,
      created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS versions (
      path TEXT NOT NULL,
      seq BLOB NOT NULL,
      record TEXT NOT NULL,
      PRIMARY KEY (path, seq)
    ) WITHOUT ROWID;
"#;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of rebuilding one version, with the work it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconstruction {
    pub content: String,
    /// Id of the full record the rebuild started from.
    pub base_id: RecordId,
    /// Number of delta records applied on top of the base.
    pub deltas_applied: usize,
}

/// Version history database of a single owner.
pub struct VersionStore {
    db_path: PathBuf,
    writer: Mutex<Connection>,
}

impl VersionStore {
    /// Open (creating if needed) the database at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            db_path,
            writer: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn reader(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Append a record for a change of `file_path` from `old_content` to `new_content`.
    ///
    /// The record kind follows [`kind_for_position`]. Deltas are computed against the
    /// content of the chain's latest record; when the caller's old state differs from
    /// it (the file was edited outside the API since), that content is rebuilt first.
    pub fn append(
        &self,
        file_path: &str,
        old_fingerprint: &Fingerprint,
        new_fingerprint: &Fingerprint,
        old_content: &str,
        new_content: &str,
        comment: &str,
    ) -> Result<RecordId> {
        let mut conn = self
            .writer
            .lock()
            .map_err(|_| HistoryError::StorageUnavailable("writer lock poisoned".to_string()))?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = count_records(&tx, file_path)?;
        let kind = kind_for_position(existing + 1);

        let payload = match kind {
            RecordKind::Full => new_content.to_string(),
            RecordKind::Delta => {
                let base = delta_base(&tx, file_path, old_fingerprint, old_content)?;
                patch::diff(&base, new_content)
                    .to_text()
                    .map_err(|e| HistoryError::StorageUnavailable(e.to_string()))?
            }
        };

        let id = next_sequence(&tx, file_path)?;
        let record = VersionRecord {
            id,
            old_fingerprint: old_fingerprint.clone(),
            new_fingerprint: new_fingerprint.clone(),
            kind,
            payload,
            comment: comment.to_string(),
            timestamp: Utc::now(),
        };
        let encoded = serde_json::to_string(&record)
            .map_err(|e| HistoryError::StorageUnavailable(format!("encode record: {}", e)))?;

        tx.execute(
            "INSERT INTO versions(path, seq, record) VALUES (?1, ?2, ?3)",
            params![file_path, &encode_id(id)[..], encoded],
        )?;
        tx.commit()?;

        debug!("Recorded {:?} version {} of {}", kind, id, file_path);
        Ok(id)
    }

    /// Summaries of every readable record, newest first. Empty if there is no chain.
    pub fn list(&self, file_path: &str) -> Result<Vec<VersionSummary>> {
        let conn = self.reader()?;
        let mut stmt =
            conn.prepare("SELECT seq, record FROM versions WHERE path = ?1 ORDER BY seq DESC")?;
        let rows = stmt.query_map(params![file_path], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (seq, encoded) = row?;
            match serde_json::from_str::<VersionRecord>(&encoded) {
                Ok(record) => summaries.push(record.summary()),
                Err(e) => warn!(
                    "Skipping unreadable version {:?} of {}: {}",
                    decode_id(&seq),
                    file_path,
                    e
                ),
            }
        }
        Ok(summaries)
    }

    /// Number of records in the chain of `file_path`.
    pub fn chain_length(&self, file_path: &str) -> Result<u64> {
        let conn = self.reader()?;
        count_records(&conn, file_path)
    }

    /// A single record, payload included.
    pub fn record(&self, file_path: &str, id: RecordId) -> Result<VersionRecord> {
        let conn = self.reader()?;
        let encoded: Option<String> = conn
            .query_row(
                "SELECT record FROM versions WHERE path = ?1 AND seq = ?2",
                params![file_path, &encode_id(id)[..]],
                |row| row.get(0),
            )
            .optional()?;
        let encoded = encoded.ok_or_else(|| HistoryError::NoSuchVersion {
            path: file_path.to_string(),
            id,
        })?;
        decode_record(file_path, id, &encoded)
    }

    /// Rebuild the content of version `id`.
    pub fn materialize(&self, file_path: &str, id: RecordId) -> Result<String> {
        Ok(self.reconstruct(file_path, id)?.content)
    }

    /// Rebuild version `id`, reporting which full record it started from and how many
    /// deltas were replayed.
    pub fn reconstruct(&self, file_path: &str, id: RecordId) -> Result<Reconstruction> {
        let conn = self.reader()?;
        reconstruct_with(&conn, file_path, id)
    }
}

fn count_records(conn: &Connection, file_path: &str) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM versions WHERE path = ?1",
        params![file_path],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

/// Reserve the next id of a chain, creating the chain on first use.
fn next_sequence(conn: &Connection, file_path: &str) -> Result<RecordId> {
    conn.execute(
        "INSERT INTO chains(path, next_seq, created_at) VALUES (?1, 1, ?2)
         ON CONFLICT(path) DO NOTHING",
        params![file_path, Utc::now().to_rfc3339()],
    )?;
    let next: i64 = conn.query_row(
        "SELECT next_seq FROM chains WHERE path = ?1",
        params![file_path],
        |row| row.get(0),
    )?;
    conn.execute(
        "UPDATE chains SET next_seq = next_seq + 1 WHERE path = ?1",
        params![file_path],
    )?;
    RecordId::try_from(next).map_err(|_| HistoryError::CorruptHistory {
        path: file_path.to_string(),
        reason: format!("invalid sequence counter {}", next),
    })
}

/// Content a new delta must be computed against: the latest record's result.
fn delta_base<'a>(
    conn: &Connection,
    file_path: &str,
    old_fingerprint: &Fingerprint,
    old_content: &'a str,
) -> Result<Cow<'a, str>> {
    let latest: Option<(Vec<u8>, String)> = conn
        .query_row(
            "SELECT seq, record FROM versions WHERE path = ?1 ORDER BY seq DESC LIMIT 1",
            params![file_path],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((seq, encoded)) = latest else {
        return Ok(Cow::Borrowed(old_content));
    };
    let id = decode_id(&seq).ok_or_else(|| HistoryError::CorruptHistory {
        path: file_path.to_string(),
        reason: format!("invalid record key of {} bytes", seq.len()),
    })?;
    let latest = decode_record(file_path, id, &encoded)?;

    if &latest.new_fingerprint == old_fingerprint {
        return Ok(Cow::Borrowed(old_content));
    }

    warn!(
        "{} changed outside recorded history since version {}; diffing against that version",
        file_path, latest.id
    );
    Ok(Cow::Owned(reconstruct_with(conn, file_path, latest.id)?.content))
}

fn reconstruct_with(conn: &Connection, file_path: &str, target: RecordId) -> Result<Reconstruction> {
    let key = encode_id(target);
    let exists = conn
        .query_row(
            "SELECT 1 FROM versions WHERE path = ?1 AND seq = ?2",
            params![file_path, &key[..]],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if !exists {
        return Err(HistoryError::NoSuchVersion {
            path: file_path.to_string(),
            id: target,
        });
    }

    // Walk backward from the target until a full snapshot.
    let mut stmt = conn.prepare(
        "SELECT seq, record FROM versions WHERE path = ?1 AND seq <= ?2 ORDER BY seq DESC",
    )?;
    let mut rows = stmt.query(params![file_path, &key[..]])?;

    let mut deltas = Vec::new();
    let mut base = None;
    let mut target_fingerprint = None;
    while let Some(row) = rows.next()? {
        let seq: Vec<u8> = row.get(0)?;
        let encoded: String = row.get(1)?;
        let id = decode_id(&seq).ok_or_else(|| HistoryError::CorruptHistory {
            path: file_path.to_string(),
            reason: format!("invalid record key of {} bytes", seq.len()),
        })?;
        let record = decode_record(file_path, id, &encoded)?;

        if target_fingerprint.is_none() {
            target_fingerprint = Some(record.new_fingerprint.clone());
        }
        match record.kind {
            RecordKind::Full => {
                base = Some(record);
                break;
            }
            RecordKind::Delta => deltas.push(record),
        }
    }

    let base = base.ok_or_else(|| HistoryError::CorruptHistory {
        path: file_path.to_string(),
        reason: format!("no full snapshot at or before version {}", target),
    })?;

    let base_id = base.id;
    let mut content = base.payload;
    for record in deltas.iter().rev() {
        content = patch::apply_text(&content, &record.payload).map_err(|source| {
            HistoryError::MalformedPatch {
                path: file_path.to_string(),
                id: record.id,
                source,
            }
        })?;
    }

    if let Some(expected) = target_fingerprint {
        let actual = Fingerprint::of(&content);
        if actual != expected {
            return Err(HistoryError::CorruptHistory {
                path: file_path.to_string(),
                reason: format!(
                    "version {} rebuilt to {} but was recorded as {}",
                    target, actual, expected
                ),
            });
        }
    }

    Ok(Reconstruction {
        content,
        base_id,
        deltas_applied: deltas.len(),
    })
}

fn decode_record(file_path: &str, id: RecordId, encoded: &str) -> Result<VersionRecord> {
    serde_json::from_str(encoded).map_err(|e| HistoryError::CorruptHistory {
        path: file_path.to_string(),
        reason: format!("version {} is unreadable: {}", id, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, VersionStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = VersionStore::open(temp_dir.path().join(".extra/versions.db")).unwrap();
        (temp_dir, store)
    }

    /// Record a sequence of contents as successive writes, returning the ids.
    fn record_writes(store: &VersionStore, path: &str, contents: &[String]) -> Vec<RecordId> {
        let mut ids = Vec::new();
        for pair in contents.windows(2) {
            let id = store
                .append(
                    path,
                    &Fingerprint::of(&pair[0]),
                    &Fingerprint::of(&pair[1]),
                    &pair[0],
                    &pair[1],
                    "",
                )
                .unwrap();
            ids.push(id);
        }
        ids
    }

    fn numbered_contents(count: usize) -> Vec<String> {
        (0..count)
            .map(|i| {
                (0..=i)
                    .map(|line| format!("line {}\n", line))
                    .collect::<String>()
            })
            .collect()
    }

    fn corrupt_record(store: &VersionStore, path: &str, id: RecordId) {
        let conn = store.writer.lock().unwrap();
        conn.execute(
            "UPDATE versions SET record = 'not json' WHERE path = ?1 AND seq = ?2",
            params![path, &encode_id(id)[..]],
        )
        .unwrap();
    }

    #[test]
    fn test_open_creates_database_file() {
        let (temp, store) = open_store();
        assert!(temp.path().join(".extra/versions.db").exists());
        assert_eq!(store.path(), temp.path().join(".extra/versions.db"));
    }

    #[test]
    fn test_empty_history_is_not_an_error() {
        let (_temp, store) = open_store();
        assert!(store.list("notes/a.md").unwrap().is_empty());
        assert_eq!(store.chain_length("notes/a.md").unwrap(), 0);
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let (_temp, store) = open_store();
        let ids = record_writes(&store, "a.md", &numbered_contents(4));
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_list_is_newest_first() {
        let (_temp, store) = open_store();
        record_writes(&store, "a.md", &numbered_contents(4));

        let ids: Vec<_> = store.list("a.md").unwrap().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn test_chain_kind_invariant() {
        let (_temp, store) = open_store();
        record_writes(&store, "a.md", &numbered_contents(121));

        let history = store.list("a.md").unwrap();
        assert_eq!(history.len(), 120);
        for summary in history {
            let expected_full = summary.id == 1 || summary.id % 50 == 0;
            assert_eq!(
                summary.kind == RecordKind::Full,
                expected_full,
                "record {} has kind {:?}",
                summary.id,
                summary.kind
            );
        }
    }

    #[test]
    fn test_every_version_reconstructs() {
        let (_temp, store) = open_store();
        let contents = numbered_contents(60);
        let ids = record_writes(&store, "a.md", &contents);

        for (index, id) in ids.iter().enumerate() {
            assert_eq!(store.materialize("a.md", *id).unwrap(), contents[index + 1]);
        }
    }

    #[test]
    fn test_reconstruction_cost_is_bounded() {
        let (_temp, store) = open_store();
        record_writes(&store, "a.md", &numbered_contents(52));

        let at_49 = store.reconstruct("a.md", 49).unwrap();
        assert_eq!(at_49.base_id, 1);
        assert_eq!(at_49.deltas_applied, 48);

        let at_50 = store.reconstruct("a.md", 50).unwrap();
        assert_eq!(at_50.base_id, 50);
        assert_eq!(at_50.deltas_applied, 0);

        let at_51 = store.reconstruct("a.md", 51).unwrap();
        assert_eq!(at_51.base_id, 50);
        assert_eq!(at_51.deltas_applied, 1);
    }

    #[test]
    fn test_chains_are_independent_per_path() {
        let (_temp, store) = open_store();
        record_writes(&store, "a.md", &numbered_contents(3));
        record_writes(&store, "b.md", &numbered_contents(2));

        assert_eq!(store.chain_length("a.md").unwrap(), 2);
        assert_eq!(store.chain_length("b.md").unwrap(), 1);
        assert_eq!(store.record("b.md", 1).unwrap().kind, RecordKind::Full);
    }

    #[test]
    fn test_noop_diff_is_still_recorded() {
        let (_temp, store) = open_store();
        let contents = vec!["a\n".to_string(), "b\n".to_string(), "b\n".to_string()];
        let ids = record_writes(&store, "a.md", &contents);

        assert_eq!(ids, vec![1, 2]);
        let record = store.record("a.md", 2).unwrap();
        assert_eq!(record.kind, RecordKind::Delta);
        assert!(patch::PatchScript::from_text(&record.payload).unwrap().is_noop());
        assert_eq!(store.materialize("a.md", 2).unwrap(), "b\n");
    }

    #[test]
    fn test_out_of_band_change_diffs_against_recorded_state() {
        let (_temp, store) = open_store();
        record_writes(&store, "a.md", &["v0\n".to_string(), "v1\n".to_string()]);

        // The file became "external\n" without a record; the next API write replaces it.
        store
            .append(
                "a.md",
                &Fingerprint::of("external\n"),
                &Fingerprint::of("v2\n"),
                "external\n",
                "v2\n",
                "after external edit",
            )
            .unwrap();

        assert_eq!(store.materialize("a.md", 1).unwrap(), "v1\n");
        assert_eq!(store.materialize("a.md", 2).unwrap(), "v2\n");
        let record = store.record("a.md", 2).unwrap();
        assert_eq!(record.old_fingerprint, Fingerprint::of("external\n"));
        assert_eq!(record.comment, "after external edit");
    }

    #[test]
    fn test_unknown_version_is_reported() {
        let (_temp, store) = open_store();
        record_writes(&store, "a.md", &numbered_contents(3));

        assert!(matches!(
            store.materialize("a.md", 7),
            Err(HistoryError::NoSuchVersion { id: 7, .. })
        ));
        assert!(matches!(
            store.materialize("missing.md", 1),
            Err(HistoryError::NoSuchVersion { .. })
        ));
        assert!(matches!(
            store.record("a.md", 0),
            Err(HistoryError::NoSuchVersion { .. })
        ));
    }

    #[test]
    fn test_list_skips_corrupt_records() {
        let (_temp, store) = open_store();
        record_writes(&store, "a.md", &numbered_contents(4));
        corrupt_record(&store, "a.md", 2);

        let ids: Vec<_> = store.list("a.md").unwrap().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![3, 1]);
    }

    #[test]
    fn test_corrupt_record_on_reconstruction_path_is_fatal() {
        let (_temp, store) = open_store();
        record_writes(&store, "a.md", &numbered_contents(4));
        corrupt_record(&store, "a.md", 2);

        assert!(matches!(
            store.materialize("a.md", 3),
            Err(HistoryError::CorruptHistory { .. })
        ));
        // Version 1 does not need record 2.
        assert!(store.materialize("a.md", 1).is_ok());
    }

    #[test]
    fn test_missing_full_base_is_corrupt_history() {
        let (_temp, store) = open_store();
        record_writes(&store, "a.md", &numbered_contents(3));
        {
            let conn = store.writer.lock().unwrap();
            conn.execute(
                "DELETE FROM versions WHERE path = 'a.md' AND seq = ?1",
                params![&encode_id(1)[..]],
            )
            .unwrap();
        }

        assert!(matches!(
            store.materialize("a.md", 2),
            Err(HistoryError::CorruptHistory { .. })
        ));
    }

    #[test]
    fn test_bad_delta_is_malformed_patch() {
        let (_temp, store) = open_store();
        record_writes(&store, "a.md", &numbered_contents(3));
        {
            let mut record = store.record("a.md", 2).unwrap();
            record.payload = r#"[{"delete":"nothing like the base"}]"#.to_string();
            let conn = store.writer.lock().unwrap();
            conn.execute(
                "UPDATE versions SET record = ?1 WHERE path = 'a.md' AND seq = ?2",
                params![serde_json::to_string(&record).unwrap(), &encode_id(2)[..]],
            )
            .unwrap();
        }

        assert!(matches!(
            store.materialize("a.md", 2),
            Err(HistoryError::MalformedPatch { id: 2, .. })
        ));
    }

    #[test]
    fn test_bad_latest_key_fails_append() {
        let (_temp, store) = open_store();
        let contents = numbered_contents(3);
        record_writes(&store, "a.md", &contents[..2]);
        {
            let conn = store.writer.lock().unwrap();
            conn.execute(
                "UPDATE versions SET seq = x'0102' WHERE path = 'a.md' AND seq = ?1",
                params![&encode_id(1)[..]],
            )
            .unwrap();
        }

        let result = store.append(
            "a.md",
            &Fingerprint::of(&contents[1]),
            &Fingerprint::of(&contents[2]),
            &contents[1],
            &contents[2],
            "",
        );
        assert!(matches!(result, Err(HistoryError::CorruptHistory { .. })));
        assert_eq!(store.chain_length("a.md").unwrap(), 1);
    }

    #[test]
    fn test_concurrent_appends_keep_chain_reconstructible() {
        let (_temp, store) = open_store();
        let store = Arc::new(store);
        let per_thread = 30;

        let writers: Vec<_> = ["left", "right"]
            .into_iter()
            .map(|name| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let mut previous = String::new();
                    for i in 0..per_thread {
                        let next = format!("{}{} edit {}\n", previous, name, i);
                        store
                            .append(
                                "shared.md",
                                &Fingerprint::of(&previous),
                                &Fingerprint::of(&next),
                                &previous,
                                &next,
                                name,
                            )
                            .unwrap();
                        previous = next;
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let total = 2 * per_thread as u64;
        assert_eq!(store.chain_length("shared.md").unwrap(), total);
        for id in 1..=total {
            let record = store.record("shared.md", id).unwrap();
            assert_eq!(record.kind, kind_for_position(id));
            let content = store.materialize("shared.md", id).unwrap();
            assert_eq!(Fingerprint::of(&content), record.new_fingerprint);
        }
    }

    #[test]
    fn test_history_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let db = temp_dir.path().join("versions.db");
        let contents = numbered_contents(3);
        {
            let store = VersionStore::open(&db).unwrap();
            record_writes(&store, "a.md", &contents);
        }

        let store = VersionStore::open(&db).unwrap();
        assert_eq!(store.chain_length("a.md").unwrap(), 2);
        assert_eq!(store.materialize("a.md", 2).unwrap(), contents[2]);
        let next = store
            .append(
                "a.md",
                &Fingerprint::of(&contents[2]),
                &Fingerprint::of("x"),
                &contents[2],
                "x",
                "",
            )
            .unwrap();
        assert_eq!(next, 3);
    }
}
