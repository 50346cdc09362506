//! Kiln Core - Incremental Build Engine
//!
//! Features:
//! - Change tracking between rebuild cycles
//! - Dependency invalidation on file and directory events
//! - Per-cycle build context with change classification
//! - Incremental program driver with coalesced rebuilds
//! - Content-addressable transform cache (BLAKE3 keys, sled storage)
//! - Build lifecycle event bus

pub mod build;
pub mod build_ctx;
pub mod cache;
pub mod changes;
pub mod compiler_ctx;
pub mod config;
pub mod diagnostic;
pub mod error;
pub mod events;
pub mod fs;
pub mod hasher;
pub mod invalidate;
pub mod module_map;
pub mod optimize_css;
pub mod program;
pub mod watch_ignore;
pub mod worker;

pub use build::{build, BuildResults};
pub use build_ctx::BuildContext;
pub use cache::{Cache, CacheStats};
pub use changes::{ChangeSet, ChangeTracker, FileEvent, FileEventKind};
pub use compiler_ctx::CompilerCtx;
pub use config::BuildConfig;
pub use diagnostic::{Diagnostic, Level};
pub use error::{KilnError, Result};
pub use events::{BuildEvent, EventBus, EventName};
pub use invalidate::{invalidate, InvalidationReport};
pub use program::{CommandService, CompilerService, IncrementalProgram, PassOutput, ProgramDriver};
pub use watch_ignore::WatchIgnore;
pub use worker::WorkerPool;
