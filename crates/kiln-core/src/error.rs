//! Error types for the build engine
//!
//! Only setup failures are meant to abort a watch session. Everything that
//! can go wrong inside a rebuild cycle is downgraded to a [`Diagnostic`]
//! or a logged anomaly.
//!
//! [`Diagnostic`]: crate::diagnostic::Diagnostic

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used across kiln-core
pub type Result<T> = std::result::Result<T, KilnError>;

#[derive(Error, Debug)]
pub enum KilnError {
    /// The watch adapter could not start observing a path
    #[error("failed to watch {path}: {message}")]
    WatchSetup { path: PathBuf, message: String },

    /// The incremental compilation service could not be constructed
    #[error("failed to create incremental program: {0}")]
    ProgramSetup(String),

    /// Read or write against the cache backend failed
    #[error("cache I/O error: {0}")]
    CacheIo(String),

    /// Ancestor walk for a module record hit the depth bound
    #[error("ancestor walk for {path} exceeded {bound} steps")]
    InvalidationBoundExceeded { path: PathBuf, bound: usize },

    /// Config file present but unusable
    #[error("invalid config {path}: {message}")]
    Config { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KilnError {
    /// Whether this error must abort `start()` of a watch session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KilnError::WatchSetup { .. } | KilnError::ProgramSetup(_) | KilnError::Config { .. }
        )
    }
}

impl From<sled::Error> for KilnError {
    fn from(e: sled::Error) -> Self {
        KilnError::CacheIo(e.to_string())
    }
}
