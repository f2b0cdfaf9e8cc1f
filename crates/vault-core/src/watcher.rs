//! Filesystem watch adapter that keeps the document cache in line with disk.
//!
//! Raw `notify` events are translated on the notifier thread into [`WatchEvent`]s
//! (plus directory bookkeeping) and sent over one unbounded channel. A single
//! consumer task applies them to the cache in arrival order, so a later event for
//! a path always wins over an earlier one.
//!
//! Each directory gets its own non-recursive subscription. Directories created
//! or moved into the tree later are subscribed to when their event arrives, and
//! their existing documents are loaded at that point.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vault_paths::{is_internal_path, LogicalPath};

use crate::cache::DocumentCache;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Failed to create watcher: {0}")]
    Notify(#[from] notify::Error),

    #[error("Vault root {path} is not readable: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What happened to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// Created or modified
    Changed,
    /// Deleted or moved away
    Removed,
}

/// A change to one document, as seen by the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: LogicalPath,
    pub kind: WatchEventKind,
}

impl WatchEvent {
    pub fn changed(path: LogicalPath) -> Self {
        Self {
            path,
            kind: WatchEventKind::Changed,
        }
    }

    pub fn removed(path: LogicalPath) -> Self {
        Self {
            path,
            kind: WatchEventKind::Removed,
        }
    }
}

/// Unit of work for the consumer task.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Signal {
    Document(WatchEvent),
    DirectoryAdded(PathBuf),
    DirectoryRemoved(PathBuf),
}

/// State shared by the adapter handle and its consumer task.
struct Shared {
    root: PathBuf,
    cache: Arc<DocumentCache>,
    watcher: Mutex<RecommendedWatcher>,
    watched: Mutex<HashSet<PathBuf>>,
}

/// Watches the vault root and mirrors document changes into the cache.
pub struct WatchAdapter {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl WatchAdapter {
    /// Load every document under `root` into `cache`, subscribe to every
    /// directory, and start the consumer task.
    pub async fn start(root: PathBuf, cache: Arc<DocumentCache>) -> Result<Self, WatchError> {
        // Watch the real path: on macOS /var is a symlink and FSEvents reports
        // canonical paths.
        let root = root.canonicalize().map_err(|source| WatchError::Root {
            path: root.clone(),
            source,
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let callback_root = root.clone();
        let watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    for signal in translate(&event, &callback_root) {
                        if tx.send(signal).is_err() {
                            // Consumer stopped
                            return;
                        }
                    }
                }
                Err(e) => error!("File watcher error: {}", e),
            }
        })?;

        let shared = Arc::new(Shared {
            root,
            cache,
            watcher: Mutex::new(watcher),
            watched: Mutex::new(HashSet::new()),
        });

        shared.load_tree(&shared.root).await;
        info!(
            "Watching {} ({} directories, {} documents cached)",
            shared.root.display(),
            shared.watched_count(),
            shared.cache.len()
        );

        let task = tokio::spawn(run(Arc::clone(&shared), rx));
        Ok(Self { shared, task })
    }

    /// Canonical root being watched.
    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    /// Number of directories with an active subscription.
    pub fn watched_dirs(&self) -> usize {
        self.shared.watched_count()
    }

    /// Apply one event to the cache exactly as the consumer task would.
    pub async fn apply(&self, event: WatchEvent) {
        self.shared.apply(&event).await;
    }

    /// Stop processing events and release the subscriptions.
    pub fn stop(self) {
        self.task.abort();
        info!("Stopped watching {}", self.shared.root.display());
    }
}

impl Drop for WatchAdapter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Signal>) {
    while let Some(signal) = rx.recv().await {
        match signal {
            Signal::Document(event) => shared.apply(&event).await,
            Signal::DirectoryAdded(dir) => shared.load_tree(&dir).await,
            Signal::DirectoryRemoved(dir) => shared.forget_tree(&dir),
        }
    }
    debug!("Watch event channel closed");
}

impl Shared {
    async fn apply(&self, event: &WatchEvent) {
        match event.kind {
            WatchEventKind::Changed => {
                let path = event.path.to_path(&self.root);
                self.refresh(&event.path, &path).await;
            }
            WatchEventKind::Removed => {
                if self.cache.remove(&event.path) {
                    debug!("Removed {} from cache", event.path);
                }
            }
        }
    }

    /// Re-read one document from disk into the cache.
    async fn refresh(&self, logical: &LogicalPath, path: &Path) {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Gone again before we got to it.
                self.cache.remove(logical);
                return;
            }
            Err(e) => {
                warn!("Failed to read {}: {}", path.display(), e);
                return;
            }
        };

        match String::from_utf8(bytes) {
            Ok(content) => {
                self.cache.put(logical.clone(), content);
                debug!("Cached {}", logical);
            }
            Err(_) => {
                // Stale text must not outlive the file it came from.
                self.cache.remove(logical);
                warn!("Dropped {} from cache: not valid UTF-8", path.display());
            }
        }
    }

    /// Subscribe to `start` and every directory below it, caching their documents.
    async fn load_tree(&self, start: &Path) {
        let mut pending = vec![start.to_path_buf()];
        while let Some(dir) = pending.pop() {
            // Subscribe before listing so nothing written in between is lost.
            self.subscribe(&dir);

            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Failed to list {}: {}", dir.display(), e);
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to list {}: {}", dir.display(), e);
                        break;
                    }
                };
                let path = entry.path();
                let is_dir = match entry.file_type().await {
                    Ok(file_type) => file_type.is_dir(),
                    Err(_) => continue,
                };

                if is_dir {
                    if is_watchable_dir(&self.root, &path) {
                        pending.push(path);
                    }
                } else if let Some(logical) = document_path(&self.root, &path) {
                    self.refresh(&logical, &path).await;
                }
            }
        }
    }

    fn subscribe(&self, dir: &Path) {
        let mut watched = self.watched.lock().unwrap_or_else(PoisonError::into_inner);
        if watched.contains(dir) {
            return;
        }

        let mut watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        match watcher.watch(dir, RecursiveMode::NonRecursive) {
            Ok(()) => {
                watched.insert(dir.to_path_buf());
                debug!("Subscribed to {}", dir.display());
            }
            Err(e) => warn!("Failed to watch {}: {}", dir.display(), e),
        }
    }

    /// Drop a directory that disappeared (deleted or moved out of the tree).
    fn forget_tree(&self, dir: &Path) {
        {
            let mut watched = self.watched.lock().unwrap_or_else(PoisonError::into_inner);
            watched.retain(|path| !path.starts_with(dir));
        }
        if let Some(logical) = LogicalPath::from_absolute(&self.root, dir) {
            let removed = self.cache.remove_tree(&logical);
            if removed > 0 {
                debug!("Removed {} cached documents under {}", removed, logical);
            }
        }
    }

    fn watched_count(&self) -> usize {
        self.watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Logical path of a document the cache should mirror.
///
/// `None` for anything [`LogicalPath`] rejects (outside the root, internal, hidden)
/// and for non-markdown files, which also covers temporary files from atomic writes.
fn document_path(root: &Path, path: &Path) -> Option<LogicalPath> {
    LogicalPath::from_absolute(root, path).filter(LogicalPath::is_markdown)
}

fn is_watchable_dir(root: &Path, path: &Path) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return false;
    };
    !is_internal_path(relative)
        && !relative
            .components()
            .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
}

/// Translate one raw notification into cache work.
fn translate(event: &Event, root: &Path) -> Vec<Signal> {
    let mut signals = Vec::new();
    match &event.kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write))
        | EventKind::Create(_)
        | EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Metadata(_))
        | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in &event.paths {
                appeared(root, path, &mut signals);
            }
        }
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in &event.paths {
                disappeared(root, path, &mut signals);
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if let [from, to] = event.paths.as_slice() {
                disappeared(root, from, &mut signals);
                appeared(root, to, &mut signals);
            } else {
                resolve_by_existence(root, &event.paths, &mut signals);
            }
        }
        EventKind::Access(_) => {}
        _ => resolve_by_existence(root, &event.paths, &mut signals),
    }

    for signal in &signals {
        debug!("Watch signal: {:?} (from {:?})", signal, event.kind);
    }
    signals
}

fn resolve_by_existence(root: &Path, paths: &[PathBuf], signals: &mut Vec<Signal>) {
    for path in paths {
        if path.exists() {
            appeared(root, path, signals);
        } else {
            disappeared(root, path, signals);
        }
    }
}

fn appeared(root: &Path, path: &Path, signals: &mut Vec<Signal>) {
    if path.is_dir() {
        if is_watchable_dir(root, path) {
            signals.push(Signal::DirectoryAdded(path.to_path_buf()));
        }
    } else if let Some(logical) = document_path(root, path) {
        signals.push(Signal::Document(WatchEvent::changed(logical)));
    }
}

fn disappeared(root: &Path, path: &Path, signals: &mut Vec<Signal>) {
    if let Some(logical) = document_path(root, path) {
        signals.push(Signal::Document(WatchEvent::removed(logical)));
    } else if is_watchable_dir(root, path) && LogicalPath::from_absolute(root, path).is_some() {
        // Cannot stat a path that is gone; treat non-documents as possible directories.
        signals.push(Signal::DirectoryRemoved(path.to_path_buf()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, RemoveKind};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::{sleep, timeout};
    use vault_paths::Owner;

    fn logical(relative: &str) -> LogicalPath {
        LogicalPath::new(&Owner::new("alice").unwrap(), relative).unwrap()
    }

    fn sandbox() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("alice")).unwrap();
        (temp_dir, root)
    }

    fn event(kind: EventKind, paths: &[&Path]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |event, path| event.add_path(path.to_path_buf()))
    }

    #[test]
    fn test_create_and_modify_are_changed() {
        let (_temp, root) = sandbox();
        let file = root.join("alice/a.md");
        std::fs::write(&file, "x").unwrap();

        for kind in [
            EventKind::Create(CreateKind::File),
            EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Content)),
            EventKind::Modify(ModifyKind::Metadata(notify::event::MetadataKind::Any)),
        ] {
            assert_eq!(
                translate(&event(kind, &[&file]), &root),
                vec![Signal::Document(WatchEvent::changed(logical("a.md")))]
            );
        }
    }

    #[test]
    fn test_remove_is_removed() {
        let (_temp, root) = sandbox();
        let file = root.join("alice/a.md");

        assert_eq!(
            translate(&event(EventKind::Remove(RemoveKind::File), &[&file]), &root),
            vec![Signal::Document(WatchEvent::removed(logical("a.md")))]
        );
    }

    #[test]
    fn test_rename_both_removes_source_and_changes_destination() {
        let (_temp, root) = sandbox();
        let from = root.join("alice/old.md");
        let to = root.join("alice/new.md");
        std::fs::write(&to, "x").unwrap();

        let kind = EventKind::Modify(ModifyKind::Name(RenameMode::Both));
        assert_eq!(
            translate(&event(kind, &[&from, &to]), &root),
            vec![
                Signal::Document(WatchEvent::removed(logical("old.md"))),
                Signal::Document(WatchEvent::changed(logical("new.md"))),
            ]
        );
    }

    #[test]
    fn test_rename_halves() {
        let (_temp, root) = sandbox();
        let file = root.join("alice/a.md");
        std::fs::write(&file, "x").unwrap();

        let from = EventKind::Modify(ModifyKind::Name(RenameMode::From));
        let to = EventKind::Modify(ModifyKind::Name(RenameMode::To));
        assert_eq!(
            translate(&event(from, &[&file]), &root),
            vec![Signal::Document(WatchEvent::removed(logical("a.md")))]
        );
        assert_eq!(
            translate(&event(to, &[&file]), &root),
            vec![Signal::Document(WatchEvent::changed(logical("a.md")))]
        );
    }

    #[test]
    fn test_ambiguous_kind_checks_disk() {
        let (_temp, root) = sandbox();
        let present = root.join("alice/present.md");
        let absent = root.join("alice/absent.md");
        std::fs::write(&present, "x").unwrap();

        let signals = translate(&event(EventKind::Any, &[&present, &absent]), &root);
        assert_eq!(
            signals,
            vec![
                Signal::Document(WatchEvent::changed(logical("present.md"))),
                Signal::Document(WatchEvent::removed(logical("absent.md"))),
            ]
        );
    }

    #[test]
    fn test_irrelevant_paths_are_discarded() {
        let (_temp, root) = sandbox();
        let outside = TempDir::new().unwrap();

        for path in [
            root.join("alice/.extra/versions.db"),
            root.join("alice/.extra/.recycle/abc/a.md"),
            root.join("alice/a.md.attach/img.md"),
            root.join("alice/image.png"),
            root.join("alice/a.0123abcd.tmp"),
            root.join("alice/.hidden.md"),
            root.join("top-level.md"),
            outside.path().join("alice/a.md"),
        ] {
            assert!(
                translate(&event(EventKind::Create(CreateKind::File), &[&path]), &root).is_empty(),
                "{} should be ignored",
                path.display()
            );
        }
    }

    #[test]
    fn test_access_events_are_ignored() {
        let (_temp, root) = sandbox();
        let file = root.join("alice/a.md");
        std::fs::write(&file, "x").unwrap();

        let kind = EventKind::Access(notify::event::AccessKind::Read);
        assert!(translate(&event(kind, &[&file]), &root).is_empty());
    }

    #[test]
    fn test_directory_events() {
        let (_temp, root) = sandbox();
        let dir = root.join("alice/notes");
        std::fs::create_dir_all(&dir).unwrap();

        assert_eq!(
            translate(&event(EventKind::Create(CreateKind::Folder), &[&dir]), &root),
            vec![Signal::DirectoryAdded(dir.clone())]
        );

        let internal = root.join("alice/.extra");
        std::fs::create_dir_all(&internal).unwrap();
        assert!(translate(&event(EventKind::Create(CreateKind::Folder), &[&internal]), &root)
            .is_empty());

        std::fs::remove_dir_all(&dir).unwrap();
        assert_eq!(
            translate(&event(EventKind::Remove(RemoveKind::Folder), &[&dir]), &root),
            vec![Signal::DirectoryRemoved(dir)]
        );
    }

    #[tokio::test]
    async fn test_start_loads_existing_documents() {
        let (_temp, root) = sandbox();
        std::fs::create_dir_all(root.join("alice/notes")).unwrap();
        std::fs::create_dir_all(root.join("alice/.extra/.recycle/x")).unwrap();
        std::fs::create_dir_all(root.join("alice/a.md.attach")).unwrap();
        std::fs::create_dir_all(root.join("bob")).unwrap();
        std::fs::write(root.join("alice/a.md"), "# A").unwrap();
        std::fs::write(root.join("alice/notes/b.md"), "# B").unwrap();
        std::fs::write(root.join("alice/notes/skip.txt"), "txt").unwrap();
        std::fs::write(root.join("alice/.extra/.recycle/x/old.md"), "old").unwrap();
        std::fs::write(root.join("alice/a.md.attach/inner.md"), "attach").unwrap();
        std::fs::write(root.join("bob/c.md"), "# C").unwrap();
        std::fs::write(root.join("alice/binary.md"), [0xff, 0xfe, 0x00]).unwrap();

        let cache = Arc::new(DocumentCache::new());
        let adapter = WatchAdapter::start(root.clone(), Arc::clone(&cache))
            .await
            .unwrap();

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(&logical("a.md")).unwrap().content, "# A");
        assert_eq!(cache.get(&logical("notes/b.md")).unwrap().content, "# B");
        assert!(cache.get(&logical("binary.md")).is_none());
        // root, alice, alice/notes, bob
        assert_eq!(adapter.watched_dirs(), 4);
        adapter.stop();
    }

    #[tokio::test]
    async fn test_apply_simulated_edits() {
        let (_temp, root) = sandbox();
        let cache = Arc::new(DocumentCache::new());
        let adapter = WatchAdapter::start(root.clone(), Arc::clone(&cache))
            .await
            .unwrap();

        std::fs::write(root.join("alice/a.md"), "external").unwrap();
        adapter.apply(WatchEvent::changed(logical("a.md"))).await;
        assert_eq!(cache.get(&logical("a.md")).unwrap().content, "external");

        std::fs::write(root.join("alice/a.md"), "edited again").unwrap();
        adapter.apply(WatchEvent::changed(logical("a.md"))).await;
        assert_eq!(cache.get(&logical("a.md")).unwrap().content, "edited again");

        std::fs::remove_file(root.join("alice/a.md")).unwrap();
        adapter.apply(WatchEvent::removed(logical("a.md"))).await;
        assert!(cache.get(&logical("a.md")).is_none());
    }

    #[tokio::test]
    async fn test_changed_for_vanished_file_removes_entry() {
        let (_temp, root) = sandbox();
        let cache = Arc::new(DocumentCache::new());
        cache.put(logical("gone.md"), "stale".to_string());
        let adapter = WatchAdapter::start(root, Arc::clone(&cache)).await.unwrap();

        adapter.apply(WatchEvent::changed(logical("gone.md"))).await;
        assert!(cache.get(&logical("gone.md")).is_none());
    }

    #[tokio::test]
    async fn test_non_utf8_overwrite_drops_cached_text() {
        let (_temp, root) = sandbox();
        let cache = Arc::new(DocumentCache::new());
        std::fs::write(root.join("alice/a.md"), "text").unwrap();
        let adapter = WatchAdapter::start(root.clone(), Arc::clone(&cache))
            .await
            .unwrap();
        assert!(cache.get(&logical("a.md")).is_some());

        std::fs::write(root.join("alice/a.md"), [0xff, 0xfe]).unwrap();
        adapter.apply(WatchEvent::changed(logical("a.md"))).await;

        assert!(cache.get(&logical("a.md")).is_none());
    }

    #[tokio::test]
    async fn test_start_fails_for_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let result =
            WatchAdapter::start(temp_dir.path().join("missing"), Arc::new(DocumentCache::new()))
                .await;
        assert!(matches!(result, Err(WatchError::Root { .. })));
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        timeout(Duration::from_secs(10), async {
            while !condition() {
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("Timed out waiting for watcher");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_real_events_reach_cache() {
        let (_temp, root) = sandbox();
        let cache = Arc::new(DocumentCache::new());
        let _adapter = WatchAdapter::start(root.clone(), Arc::clone(&cache))
            .await
            .unwrap();

        std::fs::write(root.join("alice/live.md"), "v1").unwrap();
        wait_for(|| cache.get(&logical("live.md")).is_some_and(|d| d.content == "v1")).await;

        std::fs::write(root.join("alice/live.md"), "v2").unwrap();
        wait_for(|| cache.get(&logical("live.md")).is_some_and(|d| d.content == "v2")).await;

        std::fs::remove_file(root.join("alice/live.md")).unwrap();
        wait_for(|| cache.get(&logical("live.md")).is_none()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_directories_are_followed() {
        let (_temp, root) = sandbox();
        let cache = Arc::new(DocumentCache::new());
        let _adapter = WatchAdapter::start(root.clone(), Arc::clone(&cache))
            .await
            .unwrap();

        std::fs::create_dir_all(root.join("alice/new")).unwrap();
        std::fs::write(root.join("alice/new/first.md"), "first").unwrap();
        wait_for(|| cache.get(&logical("new/first.md")).is_some()).await;

        // The subscription is in place once the first file is seen.
        std::fs::write(root.join("alice/new/second.md"), "second").unwrap();
        wait_for(|| cache.get(&logical("new/second.md")).is_some()).await;
    }
}
