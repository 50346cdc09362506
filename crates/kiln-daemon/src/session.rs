//! Watch Session - orchestrates the incremental rebuild loop
//!
//! All mutable build state (change tracker, module map, compiled styles)
//! is owned by a single task. Filesystem callbacks, pass completions and
//! control requests are funneled onto one ordered queue consumed by that
//! task, so two rebuild cycles never overlap.
//!
//! Lifecycle: `Idle → Starting → Watching → Closing → Closed`.

use crate::watcher::{FsWatchAdapter, WatchCallback, WatcherHandle};
use kiln_core::build_ctx::format_files_for_debug;
use kiln_core::{
    build, invalidate, BuildConfig, BuildContext, BuildEvent, ChangeTracker, CompilerCtx,
    CompilerService, EventBus, FileEvent, FileEventKind, KilnError, PassOutput, ProgramDriver,
    Result, WatchIgnore,
};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WatchState {
    Idle,
    Starting,
    Watching,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherCloseResults {
    pub exit_code: i32,
}

/// Completion future of a session, resolved at most once
#[derive(Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<Option<WatcherCloseResults>>>,
}

impl CloseSignal {
    fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Returns false if the signal was already resolved
    pub fn resolve(&self, results: WatcherCloseResults) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(results);
            true
        })
    }

    pub fn get(&self) -> Option<WatcherCloseResults> {
        *self.tx.borrow()
    }

    pub async fn wait(&self) -> WatcherCloseResults {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(results) = *rx.borrow_and_update() {
                return results;
            }
            if rx.changed().await.is_err() {
                return self.get().unwrap_or_default();
            }
        }
    }
}

enum SessionMessage {
    Fs {
        path: PathBuf,
        kind: FileEventKind,
    },
    PassComplete {
        output: PassOutput,
        done: oneshot::Sender<()>,
    },
    AddWatchFile {
        path: PathBuf,
        reply: oneshot::Sender<Result<()>>,
    },
    AddWatchDir {
        path: PathBuf,
        recursive: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    ModulePaths {
        reply: oneshot::Sender<Vec<PathBuf>>,
    },
    Close {
        reply: oneshot::Sender<WatcherCloseResults>,
    },
}

/// Handle to a running watch session
pub struct WatchSession {
    tx: mpsc::UnboundedSender<SessionMessage>,
    state: watch::Receiver<WatchState>,
    accepting: Arc<AtomicBool>,
    close_signal: CloseSignal,
    events: Arc<EventBus>,
}

impl WatchSession {
    /// Register watches on the source tree and root config files, start the
    /// incremental program and begin processing events.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<S>(
        config: BuildConfig,
        adapter: Arc<dyn FsWatchAdapter>,
        service: S,
        ctx: CompilerCtx,
    ) -> Result<Self>
    where
        S: CompilerService,
    {
        let (state_tx, state_rx) = watch::channel(WatchState::Idle);
        state_tx.send_replace(WatchState::Starting);
        info!("Starting watch session in {}", config.root_dir.display());

        let (tx, rx) = mpsc::unbounded_channel();
        let accepting = Arc::new(AtomicBool::new(true));

        let callback: WatchCallback = {
            let tx = tx.clone();
            let accepting = Arc::clone(&accepting);
            Arc::new(move |path: PathBuf, kind: FileEventKind| {
                if accepting.load(Ordering::SeqCst) {
                    let _ = tx.send(SessionMessage::Fs { path, kind });
                }
            })
        };

        let ignore = WatchIgnore::from_config(&config);
        let mut handles = Vec::new();
        if let Err(e) = register_watches(&config, &ctx, &ignore, adapter.as_ref(), &callback, &mut handles) {
            close_handles(&mut handles);
            return Err(e);
        }

        let driver = {
            let tx = tx.clone();
            ProgramDriver::start(&service, &config, move |output| {
                let tx = tx.clone();
                async move {
                    let (done, finished) = oneshot::channel();
                    if tx.send(SessionMessage::PassComplete { output, done }).is_ok() {
                        let _ = finished.await;
                    }
                }
            })
        };
        let driver = match driver {
            Ok(driver) => driver,
            Err(e) => {
                error!("Could not create incremental program: {}", e);
                close_handles(&mut handles);
                return Err(e);
            }
        };

        let events = Arc::clone(&ctx.events);
        let close_signal = CloseSignal::new();
        let watched_files = handles
            .iter()
            .map(|h: &WatcherHandle| h.path().to_path_buf())
            .collect();

        state_tx.send_replace(WatchState::Watching);
        let session_loop = SessionLoop {
            config,
            ctx,
            tracker: ChangeTracker::new(),
            ignore,
            adapter,
            callback,
            handles,
            watched_files,
            driver,
            is_rebuild: false,
            state: state_tx,
            close_signal: close_signal.clone(),
            rx,
        };
        tokio::spawn(session_loop.run());

        Ok(Self {
            tx,
            state: state_rx,
            accepting,
            close_signal,
            events,
        })
    }

    pub fn state(&self) -> WatchState {
        *self.state.borrow()
    }

    /// Resolves once the session has left `Starting`
    pub async fn ready(&self) -> WatchState {
        let mut state = self.state.clone();
        let reached = match state.wait_for(|s| *s >= WatchState::Watching).await {
            Ok(s) => *s,
            Err(_) => WatchState::Closed,
        };
        reached
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    pub async fn add_watch_file(&self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        let (reply, rx) = oneshot::channel();
        self.request(SessionMessage::AddWatchFile { path: path.clone(), reply }, rx, &path)
            .await
    }

    pub async fn add_watch_dir(&self, path: impl Into<PathBuf>, recursive: bool) -> Result<()> {
        let path = path.into();
        let (reply, rx) = oneshot::channel();
        self.request(
            SessionMessage::AddWatchDir {
                path: path.clone(),
                recursive,
                reply,
            },
            rx,
            &path,
        )
        .await
    }

    /// Source paths with a module record, sorted; empty once closed
    pub async fn module_paths(&self) -> Vec<PathBuf> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(SessionMessage::ModulePaths { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    async fn request(
        &self,
        message: SessionMessage,
        rx: oneshot::Receiver<Result<()>>,
        path: &Path,
    ) -> Result<()> {
        let closed = || KilnError::WatchSetup {
            path: path.to_path_buf(),
            message: "watch session is closed".to_string(),
        };
        self.tx.send(message).map_err(|_| closed())?;
        rx.await.map_err(|_| closed())?
    }

    /// Stop watching and release everything; safe to call repeatedly
    pub async fn close(&self) -> WatcherCloseResults {
        // no new fs events from here on
        self.accepting.store(false, Ordering::SeqCst);

        if let Some(results) = self.close_signal.get() {
            return results;
        }

        let (reply, rx) = oneshot::channel();
        if self.tx.send(SessionMessage::Close { reply }).is_err() {
            return self.close_signal.wait().await;
        }
        match rx.await {
            Ok(results) => results,
            Err(_) => self.close_signal.wait().await,
        }
    }

    /// Resolves with the close results once the session has closed
    pub async fn wait(&self) -> WatcherCloseResults {
        self.close_signal.wait().await
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        self.accepting.store(false, Ordering::SeqCst);
        if self.close_signal.get().is_none() {
            let (reply, _) = oneshot::channel();
            let _ = self.tx.send(SessionMessage::Close { reply });
        }
    }
}

fn register_watches(
    config: &BuildConfig,
    ctx: &CompilerCtx,
    ignore: &WatchIgnore,
    adapter: &dyn FsWatchAdapter,
    callback: &WatchCallback,
    handles: &mut Vec<WatcherHandle>,
) -> Result<()> {
    let setup_error = |path: &Path, e: std::io::Error| KilnError::WatchSetup {
        path: path.to_path_buf(),
        message: e.to_string(),
    };

    let src_files = ctx
        .fs
        .readdir(&config.src_dir, &ignore.src_readdir_options())
        .map_err(|e| setup_error(&config.src_dir, e))?;
    for entry in src_files.iter().filter(|e| e.is_file) {
        handles.push(adapter.watch_file(&entry.abs_path, Arc::clone(callback))?);
    }
    handles.push(adapter.watch_directory(&config.src_dir, Arc::clone(callback), true)?);

    let root_files = ctx
        .fs
        .readdir(&config.root_dir, &ignore.root_readdir_options())
        .map_err(|e| setup_error(&config.root_dir, e))?;
    for entry in root_files.iter().filter(|e| e.is_file && !ignore.is_ignored(&e.abs_path)) {
        handles.push(adapter.watch_file(&entry.abs_path, Arc::clone(callback))?);
    }

    debug!("Registered {} watch handle(s)", handles.len());
    Ok(())
}

fn close_handles(handles: &mut Vec<WatcherHandle>) {
    for mut handle in handles.drain(..) {
        handle.close();
    }
}

struct SessionLoop {
    config: BuildConfig,
    ctx: CompilerCtx,
    tracker: ChangeTracker,
    ignore: WatchIgnore,
    adapter: Arc<dyn FsWatchAdapter>,
    callback: WatchCallback,
    handles: Vec<WatcherHandle>,
    /// Paths with an open watch handle
    watched_files: HashSet<PathBuf>,
    driver: ProgramDriver,
    is_rebuild: bool,
    state: watch::Sender<WatchState>,
    close_signal: CloseSignal,
    rx: mpsc::UnboundedReceiver<SessionMessage>,
}

impl SessionLoop {
    async fn run(mut self) {
        while let Some(message) = self.rx.recv().await {
            match message {
                SessionMessage::Fs { path, kind } => self.on_fs_event(path, kind),
                SessionMessage::PassComplete { output, done } => {
                    self.on_build_complete(output).await;
                    let _ = done.send(());
                }
                SessionMessage::AddWatchFile { path, reply } => {
                    let _ = reply.send(self.add_watch_file(&path));
                }
                SessionMessage::AddWatchDir {
                    path,
                    recursive,
                    reply,
                } => {
                    let _ = reply.send(self.add_watch_dir(&path, recursive));
                }
                SessionMessage::ModulePaths { reply } => {
                    let _ = reply.send(self.ctx.module_map.paths());
                }
                SessionMessage::Close { reply } => {
                    self.shutdown(vec![reply]).await;
                    return;
                }
            }
        }
        self.shutdown(Vec::new()).await;
    }

    fn is_watching(&self) -> bool {
        *self.state.borrow() == WatchState::Watching
    }

    fn on_fs_event(&mut self, path: PathBuf, kind: FileEventKind) {
        if !self.is_watching() {
            return;
        }
        if self.ignore.is_ignored(&path) {
            debug!("Ignoring {} ({})", path.display(), kind);
            return;
        }

        let report = invalidate(&mut self.ctx, &self.config.root_dir, &path, kind);
        if !report.invalidated.is_empty() {
            debug!("{} module(s) invalidated", report.invalidated.len());
        }
        self.driver
            .mark_stale(std::mem::take(&mut self.ctx.changed_files));

        debug!("fs event kind={} path={}", kind, path.display());
        self.tracker.record(FileEvent::new(path, kind));
        self.driver.rebuild();
    }

    async fn on_build_complete(&mut self, output: PassOutput) {
        // a pass may finish after close started
        if !self.is_watching() {
            return;
        }

        let changes = self.tracker.drain();
        let build_id = self.ctx.next_build_id();
        let mut build_ctx = BuildContext::new(&self.config, changes, self.is_rebuild, build_id);

        if self.config.flags.debug {
            let c = &build_ctx.changes;
            debug!("BUILD {}: dirsAdded:\n{}", build_id, format_files_for_debug(&c.dirs_added));
            debug!("BUILD {}: dirsDeleted:\n{}", build_id, format_files_for_debug(&c.dirs_deleted));
            debug!("BUILD {}: filesAdded:\n{}", build_id, format_files_for_debug(&c.files_added));
            debug!("BUILD {}: filesUpdated:\n{}", build_id, format_files_for_debug(&c.files_updated));
            debug!("BUILD {}: filesDeleted:\n{}", build_id, format_files_for_debug(&c.files_deleted));
            debug!("BUILD {}: scriptsAdded:\n{}", build_id, format_files_for_debug(&build_ctx.scripts_added));
            debug!("BUILD {}: scriptsDeleted:\n{}", build_id, format_files_for_debug(&build_ctx.scripts_deleted));
        }

        if !build_ctx.changes.is_empty() {
            self.ctx
                .events
                .emit(&BuildEvent::FsChange(build_ctx.changes.clone()));
        }

        build_ctx.start();
        let results = build(&self.config, &mut self.ctx, &mut build_ctx, output).await;
        if !results.has_error {
            self.is_rebuild = true;
        }

        self.watch_style_imports();
    }

    /// Stylesheets imported from outside the source tree get their own watch
    fn watch_style_imports(&mut self) {
        let outside: Vec<PathBuf> = self
            .ctx
            .module_map
            .records()
            .flat_map(|r| r.style_imports.iter())
            .filter(|p| !p.starts_with(&self.config.src_dir) && !self.watched_files.contains(*p))
            .cloned()
            .collect();

        for path in outside {
            if let Err(e) = self.add_watch_file(&path) {
                warn!("Could not watch stylesheet {}: {}", path.display(), e);
                // don't retry every cycle
                self.watched_files.insert(path);
            }
        }
    }

    fn add_watch_file(&mut self, path: &Path) -> Result<()> {
        if self.watched_files.contains(path) || self.ignore.is_ignored(path) {
            return Ok(());
        }
        let handle = self.adapter.watch_file(path, Arc::clone(&self.callback))?;
        self.handles.push(handle);
        self.watched_files.insert(path.to_path_buf());
        Ok(())
    }

    fn add_watch_dir(&mut self, path: &Path, recursive: bool) -> Result<()> {
        if self.watched_files.contains(path) || self.ignore.is_ignored(path) {
            return Ok(());
        }
        let handle = self
            .adapter
            .watch_directory(path, Arc::clone(&self.callback), recursive)?;
        self.handles.push(handle);
        self.watched_files.insert(path.to_path_buf());
        Ok(())
    }

    async fn shutdown(&mut self, mut replies: Vec<oneshot::Sender<WatcherCloseResults>>) {
        self.state.send_replace(WatchState::Closing);
        info!("Closing watch session");

        close_handles(&mut self.handles);

        // refuse further messages; pending pass completions are released
        // by dropping their ack channel
        self.rx.close();
        while let Ok(message) = self.rx.try_recv() {
            if let SessionMessage::Close { reply } = message {
                replies.push(reply);
            }
        }

        self.driver.close().await;

        // diagnostics are advisory; a closed session always exits cleanly
        let results = WatcherCloseResults::default();
        self.state.send_replace(WatchState::Closed);
        if !self.close_signal.resolve(results) {
            warn!("Watch session close signal already resolved");
        }
        let results = self.close_signal.get().unwrap_or(results);
        for reply in replies {
            let _ = reply.send(results);
        }
        info!("Watch session closed");
    }
}
