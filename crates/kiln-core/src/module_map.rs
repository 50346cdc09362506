//! Per-file derived compiler state, keyed by absolute source path

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub source_path: PathBuf,
    /// blake3 hex digest of the source the record was derived from
    pub content_hash: String,
    /// Stylesheets referenced by the module, absolute
    pub style_imports: Vec<PathBuf>,
    /// Build that last produced this record
    pub build_id: u64,
}

#[derive(Debug, Default)]
pub struct ModuleMap {
    records: HashMap<PathBuf, ModuleRecord>,
}

impl ModuleMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; returns true when the stored record changed
    pub fn upsert(&mut self, record: ModuleRecord) -> bool {
        let unchanged = self.records.get(&record.source_path).is_some_and(|existing| {
            existing.content_hash == record.content_hash
                && existing.style_imports == record.style_imports
        });
        if unchanged {
            return false;
        }
        self.records.insert(record.source_path.clone(), record);
        true
    }

    pub fn get(&self, path: &Path) -> Option<&ModuleRecord> {
        self.records.get(path)
    }

    pub fn remove(&mut self, path: &Path) -> Option<ModuleRecord> {
        self.records.remove(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.records.contains_key(path)
    }

    /// Snapshot of every known path, sorted
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.records.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn records(&self) -> impl Iterator<Item = &ModuleRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
