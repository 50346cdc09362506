//! Stylesheet optimization stage
//!
//! Consults the content-addressable cache before handing the stylesheet to
//! the worker pool. A failed optimization falls back to the original text.

use crate::cache::{Cache, Computed};
use crate::config::{normalize, BuildConfig};
use crate::diagnostic::Diagnostic;
use crate::worker::{OptimizeCssInput, WorkerPool};
use std::path::Path;
use tracing::{debug, warn};

/// Version salt mixed into every `optimizeCss` cache key.
/// Bump the trailing revision whenever the optimizer output changes.
pub const OPTIMIZE_CSS_ID: &str = concat!("kiln-", env!("CARGO_PKG_VERSION"), "-css1");

pub struct StyleOutcome {
    pub text: String,
    pub from_cache: bool,
}

pub async fn optimize_css(
    config: &BuildConfig,
    cache: &Cache,
    worker: &WorkerPool,
    diagnostics: &mut Vec<Diagnostic>,
    style_text: &str,
    file_path: Option<&Path>,
) -> StyleOutcome {
    let passthrough = || StyleOutcome {
        text: style_text.to_string(),
        from_cache: false,
    };

    if style_text.is_empty() {
        return passthrough();
    }
    if !config.minify_css() {
        debug!("CSS minification disabled, skipping optimizer");
        return passthrough();
    }

    let opts = OptimizeCssInput {
        input: style_text.to_string(),
        file_path: file_path.map(normalize),
        minify: true,
    };

    let key = match Cache::create_key("optimizeCss", OPTIMIZE_CSS_ID, &opts) {
        Ok(key) => key,
        Err(e) => {
            warn!("Could not derive cache key, optimizing uncached: {}", e);
            let result = worker.optimize_css(opts).await;
            diagnostics.extend(result.diagnostics.iter().cloned());
            return match result.output {
                Some(text) if !crate::diagnostic::has_error(&result.diagnostics) => StyleOutcome {
                    text,
                    from_cache: false,
                },
                _ => passthrough(),
            };
        }
    };

    let computed = cache
        .get_or_compute(&key, || async move {
            let result = worker.optimize_css(opts).await;
            Computed {
                output: result.output,
                diagnostics: result.diagnostics,
                from_cache: false,
            }
        })
        .await;

    diagnostics.extend(computed.diagnostics.iter().cloned());

    if computed.is_cacheable() {
        if let Some(text) = computed.output {
            return StyleOutcome {
                text,
                from_cache: computed.from_cache,
            };
        }
    }
    passthrough()
}
