//! Session-scoped compiler state
//!
//! One `CompilerCtx` exists per watch session. It is owned by the session's
//! event loop and lent to the invalidator and the compile pass.

use crate::cache::Cache;
use crate::config::BuildConfig;
use crate::error::Result;
use crate::events::EventBus;
use crate::fs::CachedFs;
use crate::module_map::ModuleMap;
use crate::worker::WorkerPool;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub struct CompilerCtx {
    pub fs: CachedFs,
    pub module_map: ModuleMap,
    /// Paths touched since they were last handed to the incremental program
    pub changed_files: BTreeSet<PathBuf>,
    /// Optimized stylesheet text by source path
    pub compiled_styles: HashMap<PathBuf, String>,
    pub cache: Arc<Cache>,
    pub worker: WorkerPool,
    pub events: Arc<EventBus>,
    build_count: u64,
}

impl CompilerCtx {
    pub fn new(cache: Arc<Cache>, worker: WorkerPool, events: Arc<EventBus>) -> Self {
        Self {
            fs: CachedFs::new(),
            module_map: ModuleMap::new(),
            changed_files: BTreeSet::new(),
            compiled_styles: HashMap::new(),
            cache,
            worker,
            events,
            build_count: 0,
        }
    }

    /// Context wired from config: durable cache under `cache_dir` unless
    /// caching is disabled, built-in transforms.
    pub fn from_config(config: &BuildConfig) -> Result<Self> {
        let cache = if config.enable_cache {
            info!("Using cache at {}", config.cache_dir.display());
            Cache::open(&config.cache_dir)?
        } else {
            Cache::disabled()
        };
        Ok(Self::new(
            Arc::new(cache),
            WorkerPool::builtin(config.max_workers()),
            Arc::new(EventBus::new()),
        ))
    }

    /// Context with a session-only cache
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(Cache::in_memory()),
            WorkerPool::builtin(2),
            Arc::new(EventBus::new()),
        )
    }

    pub fn next_build_id(&mut self) -> u64 {
        self.build_count += 1;
        self.build_count
    }
}
