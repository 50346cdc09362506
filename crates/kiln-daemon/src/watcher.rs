//! Filesystem Watch Adapter
//!
//! Uses notify crate (FSEvents on macOS, inotify on Linux) behind a small
//! trait so the session can be driven by synthetic events in tests.
//! Every registration returns a [`WatcherHandle`]; closing the handle stops
//! delivery for that registration.

use kiln_core::{FileEventKind, KilnError, Result};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Callback invoked with `(path, kind)` for every matching change
pub type WatchCallback = Arc<dyn Fn(PathBuf, FileEventKind) + Send + Sync>;

pub trait FsWatchAdapter: Send + Sync {
    fn watch_file(&self, path: &Path, callback: WatchCallback) -> Result<WatcherHandle>;

    fn watch_directory(
        &self,
        path: &Path,
        callback: WatchCallback,
        recursive: bool,
    ) -> Result<WatcherHandle>;
}

/// Releases one watch registration when closed or dropped
pub struct WatcherHandle {
    path: PathBuf,
    closer: Option<Box<dyn FnOnce() + Send>>,
}

impl WatcherHandle {
    pub fn new(path: impl Into<PathBuf>, closer: impl FnOnce() + Send + 'static) -> Self {
        Self {
            path: path.into(),
            closer: Some(Box::new(closer)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_none()
    }

    pub fn close(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for WatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherHandle")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct Route {
    path: PathBuf,
    is_dir: bool,
    recursive: bool,
    callback: WatchCallback,
}

impl Route {
    fn matches(&self, changed: &Path) -> bool {
        if !self.is_dir {
            return changed == self.path;
        }
        if self.recursive {
            changed.starts_with(&self.path) && changed != self.path
        } else {
            changed.parent() == Some(self.path.as_path())
        }
    }
}

/// Registration table shared by the adapters
#[derive(Default)]
struct Routes {
    table: RwLock<HashMap<u64, Route>>,
    next_id: AtomicU64,
}

impl Routes {
    fn add(&self, route: Route) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut table) = self.table.write() {
            table.insert(id, route);
        }
        id
    }

    /// Remove a registration; returns its path if no other route uses it
    fn remove(&self, id: u64) -> Option<PathBuf> {
        let mut table = self.table.write().ok()?;
        let route = table.remove(&id)?;
        let still_used = table.values().any(|r| r.path == route.path);
        (!still_used).then_some(route.path)
    }

    fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .table
            .read()
            .map(|t| t.values().map(|r| r.path.clone()).collect())
            .unwrap_or_default();
        paths.sort();
        paths.dedup();
        paths
    }

    /// Deliver one change; each distinct callback fires at most once
    fn dispatch(&self, path: &Path, kind: FileEventKind) -> usize {
        let targets: Vec<WatchCallback> = match self.table.read() {
            Ok(table) => {
                let mut targets: Vec<WatchCallback> = Vec::new();
                for route in table.values().filter(|r| r.matches(path)) {
                    if !targets.iter().any(|t| Arc::ptr_eq(t, &route.callback)) {
                        targets.push(Arc::clone(&route.callback));
                    }
                }
                targets
            }
            Err(_) => return 0,
        };

        for callback in &targets {
            callback(path.to_path_buf(), kind);
        }
        targets.len()
    }
}

/// Window in which an identical native event is treated as a repeat
const REPEAT_WINDOW: Duration = Duration::from_millis(50);

/// A file with its own watch under a recursive directory watch gets one
/// native event per watch; only the first is delivered.
#[derive(Default)]
struct Repeats {
    last: Option<(PathBuf, FileEventKind, Instant)>,
}

impl Repeats {
    fn is_repeat(&mut self, path: &Path, kind: FileEventKind, now: Instant) -> bool {
        if let Some((last_path, last_kind, at)) = &self.last {
            if last_path == path && *last_kind == kind && now.duration_since(*at) < REPEAT_WINDOW {
                return true;
            }
        }
        self.last = Some((path.to_path_buf(), kind, now));
        false
    }
}

/// Watch adapter backed by the platform's native watcher
pub struct NotifyAdapter {
    watcher: Arc<Mutex<RecommendedWatcher>>,
    routes: Arc<Routes>,
}

impl NotifyAdapter {
    pub fn new() -> Result<Self> {
        let routes = Arc::new(Routes::default());

        let sink = Arc::clone(&routes);
        let mut repeats = Repeats::default();
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for (path, kind) in classify(&event) {
                        if repeats.is_repeat(&path, kind, Instant::now()) {
                            continue;
                        }
                        debug!("File change: {:?} ({})", path, kind);
                        sink.dispatch(&path, kind);
                    }
                }
                Err(e) => warn!("Watch error: {:?}", e),
            },
            Config::default(),
        )
        .map_err(|e| KilnError::WatchSetup {
            path: PathBuf::new(),
            message: e.to_string(),
        })?;

        Ok(Self {
            watcher: Arc::new(Mutex::new(watcher)),
            routes,
        })
    }

    fn register(&self, path: &Path, is_dir: bool, recursive: bool, callback: WatchCallback) -> Result<WatcherHandle> {
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };

        let setup_error = |message: String| KilnError::WatchSetup {
            path: path.to_path_buf(),
            message,
        };

        self.watcher
            .lock()
            .map_err(|_| setup_error("watcher lock poisoned".to_string()))?
            .watch(path, mode)
            .map_err(|e| setup_error(e.to_string()))?;

        let id = self.routes.add(Route {
            path: path.to_path_buf(),
            is_dir,
            recursive,
            callback,
        });

        let routes = Arc::clone(&self.routes);
        let watcher = Arc::clone(&self.watcher);
        Ok(WatcherHandle::new(path, move || {
            if let Some(released) = routes.remove(id) {
                if let Ok(mut watcher) = watcher.lock() {
                    // already gone when the path itself was deleted
                    let _ = watcher.unwatch(&released);
                }
            }
        }))
    }
}

impl FsWatchAdapter for NotifyAdapter {
    fn watch_file(&self, path: &Path, callback: WatchCallback) -> Result<WatcherHandle> {
        self.register(path, false, false, callback)
    }

    fn watch_directory(
        &self,
        path: &Path,
        callback: WatchCallback,
        recursive: bool,
    ) -> Result<WatcherHandle> {
        info!("Watching directory {:?} (recursive: {})", path, recursive);
        self.register(path, true, recursive, callback)
    }
}

fn added(path: &Path) -> FileEventKind {
    if path.is_dir() {
        FileEventKind::DirAdd
    } else {
        FileEventKind::FileAdd
    }
}

/// Map a native event onto `(path, kind)` pairs
fn classify(event: &Event) -> Vec<(PathBuf, FileEventKind)> {
    let each = |kind: FileEventKind| -> Vec<(PathBuf, FileEventKind)> {
        event.paths.iter().map(|p| (p.clone(), kind)).collect()
    };

    match event.kind {
        EventKind::Create(CreateKind::Folder) => each(FileEventKind::DirAdd),
        EventKind::Create(_) => event.paths.iter().map(|p| (p.clone(), added(p))).collect(),
        EventKind::Remove(RemoveKind::Folder) => each(FileEventKind::DirDelete),
        EventKind::Remove(_) => each(FileEventKind::FileDelete),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => each(FileEventKind::FileDelete),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.iter().map(|p| (p.clone(), added(p))).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            let to = &event.paths[1];
            let from_kind = if to.is_dir() {
                FileEventKind::DirDelete
            } else {
                FileEventKind::FileDelete
            };
            vec![(event.paths[0].clone(), from_kind), (to.clone(), added(to))]
        }
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|p| {
                if p.exists() {
                    (p.clone(), added(p))
                } else {
                    (p.clone(), FileEventKind::FileDelete)
                }
            })
            .collect(),
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => event
            .paths
            .iter()
            .filter(|p| p.is_file())
            .map(|p| (p.clone(), FileEventKind::FileUpdate))
            .collect(),
        _ => Vec::new(),
    }
}

/// Adapter driven by hand, for tests and embedding
#[derive(Default)]
pub struct ManualAdapter {
    routes: Arc<Routes>,
    fail_on: Mutex<Option<PathBuf>>,
}

impl ManualAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject a synthetic change; returns how many callbacks received it
    pub fn push(&self, path: impl AsRef<Path>, kind: FileEventKind) -> usize {
        self.routes.dispatch(path.as_ref(), kind)
    }

    /// Paths with at least one open registration
    pub fn watched(&self) -> Vec<PathBuf> {
        self.routes.paths()
    }

    /// Make the next registration of `path` fail
    pub fn fail_on(&self, path: impl Into<PathBuf>) {
        if let Ok(mut slot) = self.fail_on.lock() {
            *slot = Some(path.into());
        }
    }

    fn register(&self, path: &Path, is_dir: bool, recursive: bool, callback: WatchCallback) -> Result<WatcherHandle> {
        if let Ok(mut slot) = self.fail_on.lock() {
            if slot.as_deref() == Some(path) {
                *slot = None;
                return Err(KilnError::WatchSetup {
                    path: path.to_path_buf(),
                    message: "injected failure".to_string(),
                });
            }
        }

        let id = self.routes.add(Route {
            path: path.to_path_buf(),
            is_dir,
            recursive,
            callback,
        });
        let routes = Arc::clone(&self.routes);
        Ok(WatcherHandle::new(path, move || {
            routes.remove(id);
        }))
    }
}

impl FsWatchAdapter for ManualAdapter {
    fn watch_file(&self, path: &Path, callback: WatchCallback) -> Result<WatcherHandle> {
        self.register(path, false, false, callback)
    }

    fn watch_directory(
        &self,
        path: &Path,
        callback: WatchCallback,
        recursive: bool,
    ) -> Result<WatcherHandle> {
        self.register(path, true, recursive, callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder() -> (WatchCallback, Arc<Mutex<Vec<(PathBuf, FileEventKind)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: WatchCallback = Arc::new(move |path: PathBuf, kind: FileEventKind| {
            sink.lock().unwrap().push((path, kind));
        });
        (callback, seen)
    }

    #[test]
    fn test_manual_routes_by_registration() {
        let adapter = ManualAdapter::new();
        let (callback, seen) = recorder();

        let _dir = adapter
            .watch_directory(Path::new("/proj/src"), Arc::clone(&callback), true)
            .unwrap();
        let _file = adapter
            .watch_file(Path::new("/proj/kiln.config.json"), Arc::clone(&callback))
            .unwrap();

        assert_eq!(adapter.push("/proj/src/cmp/a.ts", FileEventKind::FileUpdate), 1);
        assert_eq!(adapter.push("/proj/kiln.config.json", FileEventKind::FileUpdate), 1);
        assert_eq!(adapter.push("/proj/README.md", FileEventKind::FileUpdate), 0);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_overlapping_routes_deliver_once() {
        let adapter = ManualAdapter::new();
        let (callback, seen) = recorder();
        let _dir = adapter
            .watch_directory(Path::new("/src"), Arc::clone(&callback), true)
            .unwrap();
        let _file = adapter
            .watch_file(Path::new("/src/a.ts"), Arc::clone(&callback))
            .unwrap();

        adapter.push("/src/a.ts", FileEventKind::FileUpdate);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_non_recursive_directory() {
        let adapter = ManualAdapter::new();
        let (callback, _seen) = recorder();
        let _dir = adapter
            .watch_directory(Path::new("/src"), callback, false)
            .unwrap();
        assert_eq!(adapter.push("/src/a.ts", FileEventKind::FileAdd), 1);
        assert_eq!(adapter.push("/src/deep/a.ts", FileEventKind::FileAdd), 0);
    }

    #[test]
    fn test_close_handle_stops_delivery() {
        let adapter = ManualAdapter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let mut handle = adapter
            .watch_file(
                Path::new("/src/a.ts"),
                Arc::new(move |_: PathBuf, _: FileEventKind| {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        adapter.push("/src/a.ts", FileEventKind::FileUpdate);
        handle.close();
        handle.close();
        adapter.push("/src/a.ts", FileEventKind::FileUpdate);

        assert!(handle.is_closed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(adapter.watched().is_empty());
    }

    #[test]
    fn test_injected_failure() {
        let adapter = ManualAdapter::new();
        let (callback, _) = recorder();
        adapter.fail_on("/src");
        let err = adapter
            .watch_directory(Path::new("/src"), Arc::clone(&callback), true)
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(adapter
            .watch_directory(Path::new("/src"), callback, true)
            .is_ok());
    }

    #[test]
    fn test_classify_rename_both() {
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/nope/old.ts"))
            .add_path(PathBuf::from("/nope/new.ts"));
        assert_eq!(
            classify(&event),
            vec![
                (PathBuf::from("/nope/old.ts"), FileEventKind::FileDelete),
                (PathBuf::from("/nope/new.ts"), FileEventKind::FileAdd),
            ]
        );
    }

    #[test]
    fn test_classify_directory_moved_within_tree() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("foo");
        let to = dir.path().join("foo2");
        std::fs::create_dir_all(&to).unwrap();

        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(from.clone())
            .add_path(to.clone());
        assert_eq!(
            classify(&event),
            vec![(from, FileEventKind::DirDelete), (to, FileEventKind::DirAdd)]
        );
    }

    #[test]
    fn test_classify_moved_out_of_tree_is_delete() {
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
            .add_path(PathBuf::from("/nope/components/foo"));
        assert_eq!(
            classify(&event),
            vec![(PathBuf::from("/nope/components/foo"), FileEventKind::FileDelete)]
        );
    }

    #[test]
    fn test_repeated_native_events_collapse() {
        let mut repeats = Repeats::default();
        let now = Instant::now();
        let a = Path::new("/src/a.ts");

        assert!(!repeats.is_repeat(a, FileEventKind::FileUpdate, now));
        assert!(repeats.is_repeat(a, FileEventKind::FileUpdate, now + Duration::from_millis(5)));
        assert!(!repeats.is_repeat(a, FileEventKind::FileDelete, now + Duration::from_millis(6)));
        assert!(!repeats.is_repeat(a, FileEventKind::FileDelete, now + REPEAT_WINDOW * 2));
        assert!(!repeats.is_repeat(Path::new("/src/b.ts"), FileEventKind::FileDelete, now + REPEAT_WINDOW * 2));
    }

    #[test]
    fn test_notify_adapter_reports_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let adapter = NotifyAdapter::new().unwrap();
        let (callback, seen) = recorder();
        let _handle = adapter.watch_directory(&root, callback, true).unwrap();

        let file = root.join("a.css");
        std::fs::write(&file, "a{}").unwrap();

        let mut delivered = false;
        for _ in 0..50 {
            if seen.lock().unwrap().iter().any(|(p, _)| *p == file) {
                delivered = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(delivered);
    }
}
