//! File-backed filesystem with an in-memory content cache
//!
//! Reads go through `read_file` so repeated cycles do not hit the disk for
//! unchanged sources. The invalidator clears entries on every fs event.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Options for [`CachedFs::readdir`]
#[derive(Debug, Clone, Default)]
pub struct ReaddirOptions {
    pub recursive: bool,
    /// Directory names skipped entirely (not descended into)
    pub exclude_dir_names: Vec<String>,
    /// File name suffixes skipped, e.g. `.spec.ts`
    pub exclude_extensions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub abs_path: PathBuf,
    pub is_file: bool,
}

#[derive(Debug, Default)]
pub struct CachedFs {
    contents: HashMap<PathBuf, Arc<str>>,
}

impl CachedFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// List entries under `dir`, never including `dir` itself
    pub fn readdir(&self, dir: &Path, opts: &ReaddirOptions) -> io::Result<Vec<DirEntryInfo>> {
        let max_depth = if opts.recursive { usize::MAX } else { 1 };

        let walker = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                if !entry.file_type().is_dir() {
                    return true;
                }
                let name = entry.file_name().to_string_lossy();
                !opts.exclude_dir_names.iter().any(|d| d.as_str() == name)
            });

        let mut entries = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| {
                e.into_io_error()
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "walk loop detected"))
            })?;

            let is_file = entry.file_type().is_file();
            if is_file {
                let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
                if opts
                    .exclude_extensions
                    .iter()
                    .any(|ext| name.ends_with(ext.as_str()))
                {
                    continue;
                }
            }

            entries.push(DirEntryInfo {
                abs_path: entry.into_path(),
                is_file,
            });
        }

        Ok(entries)
    }

    /// Read a file as UTF-8, serving from the cache when possible
    pub fn read_file(&mut self, path: &Path) -> io::Result<Arc<str>> {
        if let Some(content) = self.contents.get(path) {
            return Ok(Arc::clone(content));
        }

        let content: Arc<str> = Arc::from(fs::read_to_string(path)?);
        self.contents.insert(path.to_path_buf(), Arc::clone(&content));
        Ok(content)
    }

    pub fn clear_file_cache(&mut self, path: &Path) {
        self.contents.remove(path);
    }

    pub fn is_cached(&self, path: &Path) -> bool {
        self.contents.contains_key(path)
    }
}
