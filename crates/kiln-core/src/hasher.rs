//! Source hasher - BLAKE3 content hashing of a source tree
//!
//! Files are discovered with `ignore` (so `.gitignore` is honored) and
//! hashed in parallel with Rayon.

use anyhow::{bail, Result};
use ignore::WalkBuilder;
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHash {
    pub path: PathBuf,
    pub hash: String,
    pub size: u64,
}

pub type PathFilter = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct SourceHasher {
    root: PathBuf,
    filter: PathFilter,
}

impl SourceHasher {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            filter: Arc::new(|_: &Path| true),
        }
    }

    /// Only hash files accepted by `filter`
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Path) -> bool + Send + Sync + 'static,
    {
        self.filter = Arc::new(filter);
        self
    }

    /// Hash every matching file under the root, sorted by path
    pub fn hash_all(&self) -> Result<Vec<FileHash>> {
        if !self.root.is_dir() {
            bail!("{} is not a directory", self.root.display());
        }

        let filter = &self.filter;
        let files: Vec<PathBuf> = WalkBuilder::new(&self.root)
            .hidden(false)
            .git_ignore(true)
            .build()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|ft| ft.is_file()).unwrap_or(false))
            .map(|e| e.into_path())
            .filter(|p| filter(p.as_path()))
            .collect();

        let mut results: Vec<FileHash> = files
            .par_iter()
            .filter_map(|path| {
                // vanished between walk and read
                let content = fs::read(path).ok()?;
                Some(FileHash {
                    path: path.clone(),
                    hash: blake3::hash(&content).to_hex().to_string(),
                    size: content.len() as u64,
                })
            })
            .collect();

        results.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(results)
    }

    /// Files that are new or whose hash differs from `previous`
    pub fn changed_since(current: &[FileHash], previous: &HashMap<PathBuf, String>) -> Vec<PathBuf> {
        current
            .iter()
            .filter(|file| match previous.get(&file.path) {
                Some(old) => old != &file.hash,
                None => true,
            })
            .map(|f| f.path.clone())
            .collect()
    }
}
