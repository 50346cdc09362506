//! Compile pass run after every incremental program emit
//!
//! Folds the pass output into the module map, re-optimizes the stylesheets
//! the change set touched and reports the outcome on the event bus.

use crate::build_ctx::BuildContext;
use crate::changes::{is_style_file, ChangeSet};
use crate::compiler_ctx::CompilerCtx;
use crate::config::BuildConfig;
use crate::diagnostic::Diagnostic;
use crate::events::BuildEvent;
use crate::module_map::ModuleRecord;
use crate::optimize_css::optimize_css;
use crate::program::PassOutput;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResults {
    pub build_id: u64,
    pub is_rebuild: bool,
    pub has_error: bool,
    pub diagnostics: Vec<Diagnostic>,
    pub files_changed: Vec<PathBuf>,
    pub modules_updated: usize,
    pub styles_optimized: usize,
    pub duration_ms: u64,
}

pub async fn build(
    config: &BuildConfig,
    ctx: &mut CompilerCtx,
    build_ctx: &mut BuildContext,
    pass: PassOutput,
) -> BuildResults {
    ctx.events.emit(&BuildEvent::BuildStart {
        build_id: build_ctx.build_id,
        is_rebuild: build_ctx.is_rebuild,
    });

    build_ctx.diagnostics.extend(pass.diagnostics);

    let mut updated_imports = BTreeSet::new();
    let mut modules_updated = 0;
    for module in pass.modules {
        // the pass may have scanned a file that was deleted before it finished
        if is_gone(&module.source_path, &build_ctx.changes) {
            debug!("Dropping module {} (deleted)", module.source_path.display());
            continue;
        }
        let imports = module.style_imports.clone();
        let changed = ctx.module_map.upsert(ModuleRecord {
            source_path: module.source_path,
            content_hash: module.content_hash,
            style_imports: module.style_imports,
            build_id: build_ctx.build_id,
        });
        if changed {
            modules_updated += 1;
            updated_imports.extend(imports);
        }
    }

    let targets = style_targets(ctx, build_ctx, updated_imports);
    debug!("Optimizing {} stylesheet(s)", targets.len());

    let mut sources = Vec::with_capacity(targets.len());
    for path in targets {
        match ctx.fs.read_file(&path) {
            Ok(text) => sources.push((path, text)),
            Err(e) => {
                warn!("Could not read stylesheet {}: {}", path.display(), e);
                ctx.compiled_styles.remove(&path);
                build_ctx.diagnostics.push(
                    Diagnostic::warn("Read Style", format!("could not read stylesheet: {}", e))
                        .with_file(path),
                );
            }
        }
    }

    let cache = Arc::clone(&ctx.cache);
    let worker = ctx.worker.clone();
    let jobs = sources.into_iter().map(|(path, text)| {
        let cache = &cache;
        let worker = &worker;
        async move {
            let mut diagnostics = Vec::new();
            let outcome =
                optimize_css(config, cache, worker, &mut diagnostics, &text, Some(&path)).await;
            (path, outcome, diagnostics)
        }
    });

    let mut styles_optimized = 0;
    for (path, outcome, diagnostics) in join_all(jobs).await {
        build_ctx.diagnostics.extend(diagnostics);
        if outcome.from_cache {
            debug!("Style cache hit: {}", path.display());
        }
        ctx.compiled_styles.insert(path, outcome.text);
        styles_optimized += 1;
    }

    let results = BuildResults {
        build_id: build_ctx.build_id,
        is_rebuild: build_ctx.is_rebuild,
        has_error: build_ctx.has_error(),
        diagnostics: build_ctx.diagnostics.clone(),
        files_changed: build_ctx.files_changed.clone(),
        modules_updated,
        styles_optimized,
        duration_ms: build_ctx.duration().as_millis() as u64,
    };

    if results.has_error {
        warn!(
            "Build {} finished with {} diagnostic(s)",
            results.build_id,
            results.diagnostics.len()
        );
    } else {
        info!(
            "Build {} finished in {}ms",
            results.build_id, results.duration_ms
        );
    }
    ctx.events.emit(&BuildEvent::BuildLog {
        message: format!(
            "build {} finished: {} module(s), {} style(s)",
            results.build_id, modules_updated, styles_optimized
        ),
    });
    ctx.events.emit(&BuildEvent::BuildFinish(results.clone()));

    results
}

fn is_gone(path: &Path, changes: &ChangeSet) -> bool {
    changes.files_deleted.iter().any(|f| f == path)
        || changes.dirs_deleted.iter().any(|d| path.starts_with(d))
        || !path.exists()
}

/// Stylesheets to (re)optimize this cycle
fn style_targets(
    ctx: &CompilerCtx,
    build_ctx: &BuildContext,
    updated_imports: BTreeSet<PathBuf>,
) -> BTreeSet<PathBuf> {
    if build_ctx.requires_full_build {
        return ctx
            .module_map
            .records()
            .flat_map(|r| r.style_imports.iter().cloned())
            .collect();
    }

    let deleted: BTreeSet<&PathBuf> = build_ctx.changes.files_deleted.iter().collect();
    build_ctx
        .changes
        .files_added
        .iter()
        .chain(&build_ctx.changes.files_updated)
        .filter(|p| is_style_file(p))
        .cloned()
        .chain(updated_imports)
        .filter(|p| !deleted.contains(p))
        .collect()
}
