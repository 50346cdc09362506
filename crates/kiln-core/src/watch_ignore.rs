//! Watch ignore policy
//!
//! Decides which paths never trigger invalidation or a rebuild: tool and
//! vendor directories, build output, docs/test files and any glob patterns
//! from the config.

use crate::config::BuildConfig;
use crate::fs::ReaddirOptions;
use glob::Pattern;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

pub const EXCLUDED_DIR_NAMES: &[&str] = &[
    ".cache",
    ".git",
    ".github",
    ".kiln",
    ".vscode",
    "node_modules",
];

pub const EXCLUDED_SUFFIXES: &[&str] = &[
    ".md",
    ".markdown",
    ".txt",
    ".spec.ts",
    ".spec.tsx",
    ".e2e.ts",
    ".e2e.tsx",
    ".gitignore",
    ".editorconfig",
];

#[derive(Debug, Clone)]
pub struct WatchIgnore {
    dir_names: Vec<String>,
    suffixes: Vec<String>,
    output_dirs: Vec<PathBuf>,
    patterns: Vec<Pattern>,
}

impl Default for WatchIgnore {
    fn default() -> Self {
        Self {
            dir_names: EXCLUDED_DIR_NAMES.iter().map(|s| s.to_string()).collect(),
            suffixes: EXCLUDED_SUFFIXES.iter().map(|s| s.to_string()).collect(),
            output_dirs: Vec::new(),
            patterns: Vec::new(),
        }
    }
}

impl WatchIgnore {
    pub fn from_config(config: &BuildConfig) -> Self {
        let mut policy = Self::default();

        if let Some(www) = &config.www {
            policy.output_dirs.push(www.dir.clone());
        }
        policy.output_dirs.push(config.cache_dir.clone());

        for raw in &config.watch_ignored_patterns {
            match Pattern::new(raw) {
                Ok(p) => policy.patterns.push(p),
                Err(e) => warn!("Ignoring invalid watch pattern {:?}: {}", raw, e),
            }
        }
        policy
    }

    /// Check if path should be ignored
    pub fn is_ignored(&self, path: &Path) -> bool {
        for component in path.components() {
            if let Component::Normal(name) = component {
                let name = name.to_string_lossy();
                if self.dir_names.iter().any(|d| *d == name) {
                    return true;
                }
            }
        }

        if self.output_dirs.iter().any(|dir| path.starts_with(dir)) {
            return true;
        }

        if let Some(name) = path.file_name() {
            let name = name.to_string_lossy().to_ascii_lowercase();
            if self.suffixes.iter().any(|s| name.ends_with(s.as_str())) {
                return true;
            }
        }

        self.patterns.iter().any(|p| p.matches_path(path))
    }

    /// Readdir options used to enumerate the source tree
    pub fn src_readdir_options(&self) -> ReaddirOptions {
        ReaddirOptions {
            recursive: true,
            exclude_dir_names: self.dir_names.clone(),
            exclude_extensions: self.suffixes.clone(),
        }
    }

    /// Readdir options used for root-level config files
    pub fn root_readdir_options(&self) -> ReaddirOptions {
        ReaddirOptions {
            recursive: false,
            exclude_dir_names: self.dir_names.clone(),
            exclude_extensions: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WwwOutput;

    fn policy() -> WatchIgnore {
        let config = BuildConfig {
            root_dir: PathBuf::from("/proj"),
            www: Some(WwwOutput::default()),
            watch_ignored_patterns: vec!["**/*.snap".into()],
            ..Default::default()
        }
        .resolve();
        WatchIgnore::from_config(&config)
    }

    #[test]
    fn test_ignores_vendor_and_tool_dirs() {
        let p = policy();
        assert!(p.is_ignored(Path::new("/proj/node_modules/x/index.js")));
        assert!(p.is_ignored(Path::new("/proj/.git/HEAD")));
        assert!(p.is_ignored(Path::new("/proj/.kiln/cache/db")));
    }

    #[test]
    fn test_ignores_output_and_suffixes() {
        let p = policy();
        assert!(p.is_ignored(Path::new("/proj/www/build/app.js")));
        assert!(p.is_ignored(Path::new("/proj/src/readme.md")));
        assert!(p.is_ignored(Path::new("/proj/src/cmp/cmp.spec.tsx")));
        assert!(p.is_ignored(Path::new("/proj/src/cmp/cmp.snap")));
    }

    #[test]
    fn test_keeps_sources() {
        let p = policy();
        assert!(!p.is_ignored(Path::new("/proj/src/cmp/cmp.tsx")));
        assert!(!p.is_ignored(Path::new("/proj/src/cmp/cmp.css")));
        assert!(!p.is_ignored(Path::new("/proj/package.json")));
        // a name merely containing an excluded one is fine
        assert!(!p.is_ignored(Path::new("/proj/src/my.github.io/a.ts")));
    }
}
