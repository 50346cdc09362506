//! Change Tracker - accumulates filesystem events between rebuild cycles
//!
//! Events are bucketed per kind and deduplicated. `drain()` hands the whole
//! set to the next cycle and leaves the tracker empty.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Kind of filesystem change reported by the watch adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileEventKind {
    DirAdd,
    DirDelete,
    FileAdd,
    FileUpdate,
    FileDelete,
}

impl fmt::Display for FileEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileEventKind::DirAdd => "dirAdd",
            FileEventKind::DirDelete => "dirDelete",
            FileEventKind::FileAdd => "fileAdd",
            FileEventKind::FileUpdate => "fileUpdate",
            FileEventKind::FileDelete => "fileDelete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
}

impl FileEvent {
    pub fn new(path: impl Into<PathBuf>, kind: FileEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Drained snapshot of the tracker, every list sorted ascending
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    pub dirs_added: Vec<PathBuf>,
    pub dirs_deleted: Vec<PathBuf>,
    pub files_added: Vec<PathBuf>,
    pub files_updated: Vec<PathBuf>,
    pub files_deleted: Vec<PathBuf>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.dirs_added.is_empty()
            && self.dirs_deleted.is_empty()
            && self.files_added.is_empty()
            && self.files_updated.is_empty()
            && self.files_deleted.is_empty()
    }

    /// Union of added, updated and deleted files
    pub fn files_changed(&self) -> Vec<PathBuf> {
        let all: BTreeSet<&PathBuf> = self
            .files_added
            .iter()
            .chain(&self.files_updated)
            .chain(&self.files_deleted)
            .collect();
        all.into_iter().cloned().collect()
    }

    pub fn scripts_added(&self) -> Vec<PathBuf> {
        self.files_added
            .iter()
            .filter(|p| is_script_file(p))
            .cloned()
            .collect()
    }

    pub fn scripts_deleted(&self) -> Vec<PathBuf> {
        self.files_deleted
            .iter()
            .filter(|p| is_script_file(p))
            .cloned()
            .collect()
    }
}

/// Accumulates events until the next drain
#[derive(Debug, Default)]
pub struct ChangeTracker {
    dirs_added: BTreeSet<PathBuf>,
    dirs_deleted: BTreeSet<PathBuf>,
    files_added: BTreeSet<PathBuf>,
    files_updated: BTreeSet<PathBuf>,
    files_deleted: BTreeSet<PathBuf>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: FileEvent) {
        let FileEvent { path, kind } = event;
        match kind {
            FileEventKind::DirAdd => {
                self.dirs_deleted.remove(&path);
                self.dirs_added.insert(path);
            }
            FileEventKind::DirDelete => {
                self.dirs_added.remove(&path);
                self.dirs_deleted.insert(path);
            }
            FileEventKind::FileAdd => {
                self.files_updated.remove(&path);
                self.files_deleted.remove(&path);
                self.files_added.insert(path);
            }
            FileEventKind::FileUpdate => {
                self.files_deleted.remove(&path);
                // an add followed by writes is still an add
                if !self.files_added.contains(&path) {
                    self.files_updated.insert(path);
                }
            }
            FileEventKind::FileDelete => {
                self.files_added.remove(&path);
                self.files_updated.remove(&path);
                self.files_deleted.insert(path);
            }
        }
    }

    /// Take every recorded change and reset the tracker
    pub fn drain(&mut self) -> ChangeSet {
        let taken = std::mem::take(self);
        ChangeSet {
            dirs_added: taken.dirs_added.into_iter().collect(),
            dirs_deleted: taken.dirs_deleted.into_iter().collect(),
            files_added: taken.files_added.into_iter().collect(),
            files_updated: taken.files_updated.into_iter().collect(),
            files_deleted: taken.files_deleted.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dirs_added.is_empty()
            && self.dirs_deleted.is_empty()
            && self.files_added.is_empty()
            && self.files_updated.is_empty()
            && self.files_deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.dirs_added.len()
            + self.dirs_deleted.len()
            + self.files_added.len()
            + self.files_updated.len()
            + self.files_deleted.len()
    }
}

const SCRIPT_EXTS: &[&str] = &["ts", "tsx", "js", "jsx", "mjs", "cjs"];
const STYLE_EXTS: &[&str] = &["css", "scss", "sass", "pcss", "styl", "stylus", "less"];

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

pub fn is_script_file(path: &Path) -> bool {
    SCRIPT_EXTS.contains(&extension(path).as_str())
}

pub fn is_style_file(path: &Path) -> bool {
    STYLE_EXTS.contains(&extension(path).as_str())
}

pub fn is_html_file(path: &Path) -> bool {
    extension(path) == "html"
}
