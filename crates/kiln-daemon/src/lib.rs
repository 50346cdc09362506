//! Kiln Daemon - Watch-mode rebuild loop
//!
//! Features:
//! - File watching with notify (FSEvents on macOS, inotify on Linux)
//! - Single-queue session loop: invalidate, record, rebuild
//! - Idempotent shutdown with a one-shot completion signal

pub mod session;
pub mod watcher;

pub use session::{CloseSignal, WatchSession, WatchState, WatcherCloseResults};
pub use watcher::{FsWatchAdapter, ManualAdapter, NotifyAdapter, WatchCallback, WatcherHandle};
