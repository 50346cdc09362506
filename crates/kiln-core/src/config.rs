//! Build configuration
//!
//! Loaded from `kiln.config.json` at the project root. Every field has a
//! default so a project without a config file still builds.

use crate::error::{KilnError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "kiln.config.json";

/// Validated build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildConfig {
    pub root_dir: PathBuf,
    pub src_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub dev_mode: bool,
    /// `None` means "minify unless in dev mode"
    pub minify_css: Option<bool>,
    pub enable_cache: bool,
    /// Shell command run on every incremental pass, e.g. `tsc -p .`
    pub compile_command: Option<String>,
    pub max_workers: Option<usize>,
    pub watch_ignored_patterns: Vec<String>,
    pub www: Option<WwwOutput>,
    pub flags: BuildFlags,
}

/// Browser-loadable output target
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WwwOutput {
    pub dir: PathBuf,
    pub index_html: PathBuf,
    pub service_worker: Option<ServiceWorkerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceWorkerConfig {
    pub sw_src: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildFlags {
    pub debug: bool,
    pub service_worker: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            src_dir: PathBuf::from("src"),
            cache_dir: PathBuf::from(".kiln").join("cache"),
            dev_mode: true,
            minify_css: None,
            enable_cache: true,
            compile_command: None,
            max_workers: None,
            watch_ignored_patterns: Vec::new(),
            www: None,
            flags: BuildFlags::default(),
        }
    }
}

impl Default for WwwOutput {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("www"),
            index_html: PathBuf::from("src").join("index.html"),
            service_worker: None,
        }
    }
}

impl BuildConfig {
    /// Load config from `<root>/kiln.config.json` and resolve it
    pub fn load(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let path = root.join(CONFIG_FILE_NAME);

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str::<BuildConfig>(&content).map_err(|e| KilnError::Config {
                path: path.clone(),
                message: e.to_string(),
            })?
        } else {
            tracing::debug!("No {} found, using defaults", CONFIG_FILE_NAME);
            BuildConfig::default()
        };

        if config.root_dir.is_relative() {
            config.root_dir = root.join(&config.root_dir);
        }
        Ok(config.resolve())
    }

    /// Make every configured path absolute against `root_dir`
    pub fn resolve(mut self) -> Self {
        self.root_dir = normalize(&self.root_dir);
        let root = self.root_dir.clone();
        let absolute = |p: &Path| {
            if p.is_absolute() {
                normalize(p)
            } else {
                normalize(&root.join(p))
            }
        };

        self.src_dir = absolute(&self.src_dir);
        self.cache_dir = absolute(&self.cache_dir);
        if let Some(www) = self.www.as_mut() {
            www.dir = absolute(&www.dir);
            www.index_html = absolute(&www.index_html);
            if let Some(sw) = www.service_worker.as_mut() {
                sw.sw_src = absolute(&sw.sw_src);
            }
        }
        self
    }

    pub fn minify_css(&self) -> bool {
        self.minify_css.unwrap_or(!self.dev_mode)
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers.filter(|n| *n > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4)
        })
    }
}

/// Lexically normalize a path: drop `.` segments and fold `..`
pub fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BuildConfig::default();
        assert!(config.dev_mode);
        assert!(!config.minify_css());
        assert!(config.www.is_none());
        assert!(config.max_workers() >= 1);
    }

    #[test]
    fn test_resolve_makes_paths_absolute() {
        let config = BuildConfig {
            root_dir: PathBuf::from("/proj"),
            www: Some(WwwOutput::default()),
            ..Default::default()
        }
        .resolve();

        assert_eq!(config.src_dir, PathBuf::from("/proj/src"));
        assert_eq!(config.cache_dir, PathBuf::from("/proj/.kiln/cache"));
        let www = config.www.unwrap();
        assert_eq!(www.dir, PathBuf::from("/proj/www"));
        assert_eq!(www.index_html, PathBuf::from("/proj/src/index.html"));
    }

    #[test]
    fn test_load_from_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{ "srcDir": "lib", "devMode": false, "flags": { "debug": true } }"#,
        )
        .unwrap();

        let config = BuildConfig::load(dir.path()).unwrap();
        assert!(config.src_dir.ends_with("lib"));
        assert!(config.minify_css());
        assert!(config.flags.debug);
    }

    #[test]
    fn test_load_invalid_json_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "{ nope").unwrap();

        let err = BuildConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, KilnError::Config { .. }));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
    }
}
