//! Dependency Invalidator - purges stale per-file state on fs events
//!
//! Runs synchronously for every accepted event, before the event is
//! recorded into the change tracker, so the next cycle never sees module
//! records for files that no longer exist.

use crate::changes::FileEventKind;
use crate::compiler_ctx::CompilerCtx;
use crate::error::KilnError;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Upper bound on ancestor steps walked per module record
pub const MAX_ANCESTOR_DEPTH: usize = 50;

#[derive(Debug, Default)]
pub struct InvalidationReport {
    /// Module records removed by this event
    pub invalidated: Vec<PathBuf>,
    /// Records whose ancestor walk hit the depth bound
    pub anomalies: Vec<KilnError>,
}

#[derive(Debug, PartialEq, Eq)]
enum AncestorWalk {
    Found,
    NotFound,
    BoundExceeded,
}

/// Apply one fs event to the shared compiler state
pub fn invalidate(
    ctx: &mut CompilerCtx,
    root_dir: &Path,
    path: &Path,
    kind: FileEventKind,
) -> InvalidationReport {
    let mut report = InvalidationReport::default();

    ctx.fs.clear_file_cache(path);
    ctx.changed_files.insert(path.to_path_buf());

    match kind {
        FileEventKind::FileDelete => {
            if ctx.module_map.remove(path).is_some() {
                debug!("Invalidated module {}", path.display());
                report.invalidated.push(path.to_path_buf());
            }
            // a directory moved away is only reported as its own path vanishing
            invalidate_descendants(ctx, root_dir, path, &mut report);
        }
        FileEventKind::DirDelete => invalidate_descendants(ctx, root_dir, path, &mut report),
        FileEventKind::DirAdd | FileEventKind::FileAdd | FileEventKind::FileUpdate => {}
    }

    report
}

/// Drop every module record with `dir` among its ancestors
fn invalidate_descendants(
    ctx: &mut CompilerCtx,
    root_dir: &Path,
    dir: &Path,
    report: &mut InvalidationReport,
) {
    for module_path in ctx.module_map.paths() {
        match walk_ancestors(&module_path, dir, root_dir, MAX_ANCESTOR_DEPTH) {
            AncestorWalk::Found => {
                ctx.fs.clear_file_cache(&module_path);
                ctx.module_map.remove(&module_path);
                ctx.changed_files.insert(module_path.clone());
                debug!(
                    "Invalidated module {} (dir {} deleted)",
                    module_path.display(),
                    dir.display()
                );
                report.invalidated.push(module_path);
            }
            AncestorWalk::NotFound => {}
            AncestorWalk::BoundExceeded => {
                let anomaly = KilnError::InvalidationBoundExceeded {
                    path: module_path,
                    bound: MAX_ANCESTOR_DEPTH,
                };
                warn!("{}", anomaly);
                report.anomalies.push(anomaly);
            }
        }
    }
    // styles are not module records but live under the same tree
    ctx.compiled_styles.retain(|style, _| !style.starts_with(dir));
}

/// Walk upward from the parent of `module_path` looking for `deleted_dir`.
/// Stops at the project root or the filesystem root.
fn walk_ancestors(
    module_path: &Path,
    deleted_dir: &Path,
    root_dir: &Path,
    bound: usize,
) -> AncestorWalk {
    let mut ancestor = match module_path.parent() {
        Some(dir) => dir,
        None => return AncestorWalk::NotFound,
    };

    for _ in 0..bound {
        if ancestor == root_dir {
            return AncestorWalk::NotFound;
        }
        if ancestor == deleted_dir {
            return AncestorWalk::Found;
        }
        match ancestor.parent() {
            Some(parent) => ancestor = parent,
            None => return AncestorWalk::NotFound,
        }
    }

    AncestorWalk::BoundExceeded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module_map::ModuleRecord;

    fn record(path: &str) -> ModuleRecord {
        ModuleRecord {
            source_path: PathBuf::from(path),
            content_hash: "h".into(),
            style_imports: vec![],
            build_id: 1,
        }
    }

    #[test]
    fn test_file_delete_removes_exact_record() {
        let mut ctx = CompilerCtx::in_memory();
        ctx.module_map.upsert(record("/proj/src/a.ts"));
        ctx.module_map.upsert(record("/proj/src/ab.ts"));

        let report = invalidate(
            &mut ctx,
            Path::new("/proj"),
            Path::new("/proj/src/a.ts"),
            FileEventKind::FileDelete,
        );

        assert_eq!(report.invalidated, vec![PathBuf::from("/proj/src/a.ts")]);
        assert!(ctx.module_map.get(Path::new("/proj/src/a.ts")).is_none());
        assert!(ctx.module_map.contains(Path::new("/proj/src/ab.ts")));
        assert!(ctx.changed_files.contains(Path::new("/proj/src/a.ts")));
    }

    #[test]
    fn test_dir_delete_invalidates_descendants_only() {
        let mut ctx = CompilerCtx::in_memory();
        ctx.module_map.upsert(record("/src/components/foo/foo.ts"));
        ctx.module_map.upsert(record("/src/components/foo/inner/util.ts"));
        ctx.module_map.upsert(record("/src/components/bar/bar.ts"));
        ctx.module_map.upsert(record("/src/components/foobar/foobar.ts"));

        let report = invalidate(
            &mut ctx,
            Path::new("/"),
            Path::new("/src/components/foo"),
            FileEventKind::DirDelete,
        );

        assert_eq!(report.invalidated.len(), 2);
        assert!(report.anomalies.is_empty());
        assert!(!ctx.module_map.contains(Path::new("/src/components/foo/foo.ts")));
        assert!(!ctx
            .module_map
            .contains(Path::new("/src/components/foo/inner/util.ts")));
        assert!(ctx.module_map.contains(Path::new("/src/components/bar/bar.ts")));
        assert!(ctx
            .module_map
            .contains(Path::new("/src/components/foobar/foobar.ts")));
        assert!(ctx
            .changed_files
            .contains(Path::new("/src/components/foo/foo.ts")));
    }

    #[test]
    fn test_vanished_directory_reported_as_file_invalidates_descendants() {
        let mut ctx = CompilerCtx::in_memory();
        ctx.module_map.upsert(record("/proj/src/components/foo/foo.ts"));
        ctx.module_map.upsert(record("/proj/src/components/bar/bar.ts"));
        ctx.compiled_styles
            .insert(PathBuf::from("/proj/src/components/foo/foo.css"), "a{}".into());

        let report = invalidate(
            &mut ctx,
            Path::new("/proj"),
            Path::new("/proj/src/components/foo"),
            FileEventKind::FileDelete,
        );

        assert_eq!(
            report.invalidated,
            vec![PathBuf::from("/proj/src/components/foo/foo.ts")]
        );
        assert_eq!(
            ctx.module_map.paths(),
            vec![PathBuf::from("/proj/src/components/bar/bar.ts")]
        );
        assert!(ctx.compiled_styles.is_empty());
    }

    #[test]
    fn test_walk_stops_at_project_root() {
        // a deleted dir above the project root is never matched
        let mut ctx = CompilerCtx::in_memory();
        ctx.module_map.upsert(record("/work/proj/src/a.ts"));

        let report = invalidate(
            &mut ctx,
            Path::new("/work/proj"),
            Path::new("/work"),
            FileEventKind::DirDelete,
        );
        assert!(report.invalidated.is_empty());
        assert!(ctx.module_map.contains(Path::new("/work/proj/src/a.ts")));
    }

    #[test]
    fn test_bound_exceeded_is_skipped_not_fatal() {
        let mut deep = PathBuf::from("/deep");
        for i in 0..(MAX_ANCESTOR_DEPTH + 5) {
            deep.push(format!("d{}", i));
        }
        deep.push("leaf.ts");
        let deep_str = deep.to_string_lossy().to_string();

        let mut ctx = CompilerCtx::in_memory();
        ctx.module_map.upsert(record(&deep_str));
        ctx.module_map.upsert(record("/other/x/x.ts"));

        let report = invalidate(
            &mut ctx,
            Path::new("/"),
            Path::new("/other/x"),
            FileEventKind::DirDelete,
        );

        assert_eq!(report.invalidated, vec![PathBuf::from("/other/x/x.ts")]);
        assert_eq!(report.anomalies.len(), 1);
        assert!(matches!(
            report.anomalies[0],
            KilnError::InvalidationBoundExceeded { .. }
        ));
        // the over-deep record is left alone
        assert!(ctx.module_map.contains(&deep));
    }

    #[test]
    fn test_updates_clear_file_cache_only() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.ts");
        std::fs::write(&file, "export const a = 1;").unwrap();

        let mut ctx = CompilerCtx::in_memory();
        ctx.fs.read_file(&file).unwrap();
        ctx.module_map.upsert(ModuleRecord {
            source_path: file.clone(),
            content_hash: "h".into(),
            style_imports: vec![],
            build_id: 1,
        });

        invalidate(&mut ctx, dir.path(), &file, FileEventKind::FileUpdate);
        assert!(!ctx.fs.is_cached(&file));
        assert!(ctx.module_map.contains(&file));
    }
}
