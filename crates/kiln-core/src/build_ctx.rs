//! Build Context - per-cycle snapshot of what changed
//!
//! Created fresh for every rebuild from a drained [`ChangeSet`] and dropped
//! when the cycle completes.

use crate::changes::{is_html_file, is_script_file, is_style_file, ChangeSet};
use crate::config::BuildConfig;
use crate::diagnostic::{has_error, Diagnostic};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct BuildContext {
    pub build_id: u64,
    pub changes: ChangeSet,
    pub files_changed: Vec<PathBuf>,
    pub scripts_added: Vec<PathBuf>,
    pub scripts_deleted: Vec<PathBuf>,
    pub has_script_changes: bool,
    pub has_style_changes: bool,
    pub has_html_changes: bool,
    pub has_service_worker_changes: bool,
    pub is_rebuild: bool,
    pub requires_full_build: bool,
    pub diagnostics: Vec<Diagnostic>,
    started_at: Option<Instant>,
}

impl BuildContext {
    pub fn new(config: &BuildConfig, changes: ChangeSet, is_rebuild: bool, build_id: u64) -> Self {
        let files_changed = changes.files_changed();
        let scripts_added = changes.scripts_added();
        let scripts_deleted = changes.scripts_deleted();

        let has_script_changes = files_changed.iter().any(|f| is_script_file(f));
        let has_style_changes = files_changed.iter().any(|f| is_style_file(f));
        let has_html_changes = html_changed(config, &files_changed);
        let has_service_worker_changes = service_worker_changed(config, &files_changed);

        Self {
            build_id,
            changes,
            files_changed,
            scripts_added,
            scripts_deleted,
            has_script_changes,
            has_style_changes,
            has_html_changes,
            has_service_worker_changes,
            is_rebuild,
            requires_full_build: !is_rebuild,
            diagnostics: Vec::new(),
            started_at: None,
        }
    }

    /// Mark the start of the compile pass
    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    pub fn duration(&self) -> Duration {
        self.started_at.map(|t| t.elapsed()).unwrap_or_default()
    }

    pub fn has_error(&self) -> bool {
        has_error(&self.diagnostics)
    }
}

fn html_changed(config: &BuildConfig, files_changed: &[PathBuf]) -> bool {
    let Some(www) = &config.www else {
        return false;
    };
    files_changed
        .iter()
        .any(|f| is_html_file(f) || *f == www.index_html)
}

fn service_worker_changed(config: &BuildConfig, files_changed: &[PathBuf]) -> bool {
    if config.dev_mode && !config.flags.service_worker {
        return false;
    }
    let Some(sw) = config.www.as_ref().and_then(|w| w.service_worker.as_ref()) else {
        return false;
    };
    let Some(sw_name) = lowercase_file_name(&sw.sw_src) else {
        return false;
    };
    files_changed
        .iter()
        .any(|f| lowercase_file_name(f).as_deref() == Some(sw_name.as_str()))
}

fn lowercase_file_name(path: &Path) -> Option<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
}

/// One line per file prefixed with `-`, or `none`
pub fn format_files_for_debug(files: &[PathBuf]) -> String {
    if files.is_empty() {
        return "none".to_string();
    }
    files
        .iter()
        .map(|f| format!("-{}", f.display()))
        .collect::<Vec<_>>()
        .join("\n")
}
