//! Incremental Program Driver
//!
//! Owns a long-lived incremental program on a background task. The first
//! pass runs as soon as the driver starts; afterwards the task parks until
//! [`ProgramDriver::rebuild`] is called. Rebuild requests made while a pass
//! is in flight coalesce into a single follow-up pass.

mod command;

pub use command::{extract_style_imports, CommandProgram, CommandService};

use crate::config::BuildConfig;
use crate::diagnostic::Diagnostic;
use crate::error::Result;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A source module the program (re)emitted this pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedModule {
    pub source_path: PathBuf,
    pub content_hash: String,
    pub style_imports: Vec<PathBuf>,
}

/// Result of one incremental pass
#[derive(Debug, Clone, Default)]
pub struct PassOutput {
    pub modules: Vec<EmittedModule>,
    pub diagnostics: Vec<Diagnostic>,
}

pub trait IncrementalProgram: Send + 'static {
    /// Run one pass; only modules that changed since the previous pass are
    /// reported.
    fn emit(&mut self) -> impl Future<Output = PassOutput> + Send;

    /// Forget what the program knows about `paths` (files or directories),
    /// so the next pass re-emits whatever still exists there.
    fn invalidate(&mut self, _paths: &[PathBuf]) {}

    fn close(&mut self);
}

/// Factory for incremental programs
pub trait CompilerService {
    type Program: IncrementalProgram;

    fn create_program(&self, config: &BuildConfig) -> Result<Self::Program>;
}

pub struct ProgramDriver {
    wake: Arc<Notify>,
    closed: Arc<AtomicBool>,
    /// Paths handed to the program before its next pass
    stale: Arc<Mutex<Vec<PathBuf>>>,
    task: Option<JoinHandle<()>>,
}

impl ProgramDriver {
    /// Create the program and start the pass loop.
    ///
    /// `on_build_complete` is awaited after every pass; the next pass never
    /// starts before it returns.
    pub fn start<S, F, Fut>(service: &S, config: &BuildConfig, mut on_build_complete: F) -> Result<Self>
    where
        S: CompilerService,
        F: FnMut(PassOutput) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut program = service.create_program(config)?;

        let wake = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));
        let stale = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let wake = Arc::clone(&wake);
            let closed = Arc::clone(&closed);
            let stale = Arc::clone(&stale);
            tokio::spawn(async move {
                let mut pass = 0u64;
                loop {
                    pass += 1;
                    let paths = take_stale(&stale);
                    if !paths.is_empty() {
                        program.invalidate(&paths);
                    }
                    debug!("Incremental pass {} starting ({} stale path(s))", pass, paths.len());
                    let output = program.emit().await;
                    if closed.load(Ordering::SeqCst) {
                        break;
                    }
                    on_build_complete(output).await;

                    // a stored permit means a rebuild was requested mid-pass
                    wake.notified().await;
                    if closed.load(Ordering::SeqCst) {
                        break;
                    }
                }
                program.close();
                debug!("Incremental program closed after {} pass(es)", pass);
            })
        };

        Ok(Self {
            wake,
            closed,
            stale,
            task: Some(task),
        })
    }

    /// Paths the program must forget before its next pass
    pub fn mark_stale(&self, paths: impl IntoIterator<Item = PathBuf>) {
        let mut stale = self.stale.lock().unwrap_or_else(|e| e.into_inner());
        stale.extend(paths);
    }

    /// Request another pass
    pub fn rebuild(&self) {
        if !self.closed.load(Ordering::SeqCst) {
            self.wake.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the loop and release the program; waits for an in-flight pass
    pub async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Program driver task failed: {}", e);
            }
        }
    }
}

fn take_stale(stale: &Mutex<Vec<PathBuf>>) -> Vec<PathBuf> {
    std::mem::take(&mut *stale.lock().unwrap_or_else(|e| e.into_inner()))
}

impl Drop for ProgramDriver {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }
}
