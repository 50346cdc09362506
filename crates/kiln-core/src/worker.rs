//! Transform worker boundary
//!
//! CPU-bound transforms run on tokio's blocking pool, bounded by a
//! semaphore so a large change set cannot flood every core at once.

use crate::diagnostic::Diagnostic;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Input of the `optimizeCss` operation; also the cache key input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeCssInput {
    pub input: String,
    pub file_path: Option<PathBuf>,
    pub minify: bool,
}

#[derive(Debug, Clone)]
pub enum TransformRequest {
    OptimizeCss(OptimizeCssInput),
}

impl TransformRequest {
    pub fn operation_name(&self) -> &'static str {
        match self {
            TransformRequest::OptimizeCss(_) => "optimizeCss",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransformOutput {
    pub output: Option<String>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Something that performs transforms synchronously
pub trait Transformer: Send + Sync + 'static {
    fn invoke(&self, request: &TransformRequest) -> TransformOutput;
}

/// Transforms implemented in-process
#[derive(Debug, Default)]
pub struct BuiltinTransformer;

impl Transformer for BuiltinTransformer {
    fn invoke(&self, request: &TransformRequest) -> TransformOutput {
        match request {
            TransformRequest::OptimizeCss(opts) => {
                if !opts.minify {
                    return TransformOutput {
                        output: Some(opts.input.clone()),
                        diagnostics: Vec::new(),
                    };
                }
                match minify_css(&opts.input) {
                    Ok(css) => TransformOutput {
                        output: Some(css),
                        diagnostics: Vec::new(),
                    },
                    Err(message) => {
                        let mut diag = Diagnostic::error("Optimize CSS", message);
                        diag.file = opts.file_path.clone();
                        TransformOutput {
                            output: None,
                            diagnostics: vec![diag],
                        }
                    }
                }
            }
        }
    }
}

/// Dispatches transform requests to blocking threads
#[derive(Clone)]
pub struct WorkerPool {
    transformer: Arc<dyn Transformer>,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(transformer: Arc<dyn Transformer>, max_workers: usize) -> Self {
        Self {
            transformer,
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
        }
    }

    pub fn builtin(max_workers: usize) -> Self {
        Self::new(Arc::new(BuiltinTransformer), max_workers)
    }

    pub async fn invoke(&self, request: TransformRequest) -> TransformOutput {
        let operation = request.operation_name();

        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return TransformOutput {
                    output: None,
                    diagnostics: vec![Diagnostic::error(operation, "worker pool closed")],
                }
            }
        };

        let transformer = Arc::clone(&self.transformer);
        match tokio::task::spawn_blocking(move || transformer.invoke(&request)).await {
            Ok(output) => output,
            Err(e) => TransformOutput {
                output: None,
                diagnostics: vec![Diagnostic::error(
                    operation,
                    format!("worker panicked: {}", e),
                )],
            },
        }
    }

    pub async fn optimize_css(&self, input: OptimizeCssInput) -> TransformOutput {
        self.invoke(TransformRequest::OptimizeCss(input)).await
    }
}

/// Strip comments and redundant whitespace from a stylesheet.
/// String literals are copied untouched.
pub fn minify_css(css: &str) -> Result<String, String> {
    let bytes = css.as_bytes();
    let mut out = String::with_capacity(css.len());
    let mut i = 0;
    let mut pending_space = false;

    while i < bytes.len() {
        let c = bytes[i];

        if c == b'/' && bytes.get(i + 1) == Some(&b'*') {
            let end = css[i + 2..]
                .find("*/")
                .ok_or_else(|| format!("unterminated comment at byte {}", i))?;
            i += 2 + end + 2;
            pending_space = true;
            continue;
        }

        if c == b'"' || c == b'\'' {
            let start = i;
            i += 1;
            while i < bytes.len() && bytes[i] != c {
                if bytes[i] == b'\\' {
                    i += 1;
                }
                i += 1;
            }
            if i >= bytes.len() {
                return Err(format!("unterminated string at byte {}", start));
            }
            flush_space(&mut out, &mut pending_space);
            out.push_str(&css[start..=i]);
            i += 1;
            continue;
        }

        if c.is_ascii_whitespace() {
            pending_space = true;
            i += 1;
            continue;
        }

        if matches!(c, b'{' | b'}' | b':' | b';' | b',' | b'>') {
            // `.a :hover` is a descendant selector, `.a:hover` is not
            if c == b':' && pending_space && in_selector(&css[i..]) {
                flush_space(&mut out, &mut pending_space);
            }
            pending_space = false;
            if c == b'}' && out.ends_with(';') {
                out.pop();
            }
            out.push(c as char);
            i += 1;
            continue;
        }

        flush_space(&mut out, &mut pending_space);
        let ch_len = css[i..].chars().next().map(char::len_utf8).unwrap_or(1);
        out.push_str(&css[i..i + ch_len]);
        i += ch_len;
    }

    Ok(out)
}

/// Whether the text up to the next `{`, `;` or `}` is a selector prelude
fn in_selector(rest: &str) -> bool {
    let bytes = rest.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'{' => return true,
            b';' | b'}' => return false,
            q @ (b'"' | b'\'') => {
                i += 1;
                while i < bytes.len() && bytes[i] != q {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    false
}

fn flush_space(out: &mut String, pending: &mut bool) {
    if *pending {
        let after_punct = out
            .chars()
            .last()
            .map(|c| matches!(c, '{' | '}' | ':' | ';' | ',' | '>'))
            .unwrap_or(true);
        if !after_punct {
            out.push(' ');
        }
        *pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minify_basic() {
        let css = "/* header */\n.a ,  .b > .c {\n  color : red;\n  margin: 0 auto;\n}\n";
        assert_eq!(minify_css(css).unwrap(), ".a,.b>.c{color:red;margin:0 auto}");
    }

    #[test]
    fn test_minify_keeps_descendant_pseudo_class() {
        assert_eq!(
            minify_css(".a :hover { color : red }").unwrap(),
            ".a :hover{color:red}"
        );
        assert_eq!(
            minify_css(".a:hover, .b :not(.c) > .d { top: 0; }").unwrap(),
            ".a:hover,.b :not(.c)>.d{top:0}"
        );
        assert_eq!(
            minify_css("@media (min-width: 1px) { .a :focus { margin : 0 } }").unwrap(),
            "@media (min-width:1px){.a :focus{margin:0}}"
        );
    }

    #[test]
    fn test_minify_keeps_strings() {
        let css = ".a::before { content: \"  /* not a comment */ \"; }";
        assert_eq!(
            minify_css(css).unwrap(),
            ".a::before{content:\"  /* not a comment */ \"}"
        );
    }

    #[test]
    fn test_minify_unterminated_comment_fails() {
        assert!(minify_css(".a { color: red; } /* oops").is_err());
    }

    #[test]
    fn test_builtin_reports_error_diagnostic() {
        let out = BuiltinTransformer.invoke(&TransformRequest::OptimizeCss(OptimizeCssInput {
            input: "/* oops".into(),
            file_path: Some(PathBuf::from("/src/a.css")),
            minify: true,
        }));
        assert!(out.output.is_none());
        assert_eq!(out.diagnostics.len(), 1);
        assert_eq!(out.diagnostics[0].file, Some(PathBuf::from("/src/a.css")));
    }

    #[tokio::test]
    async fn test_pool_runs_transform() {
        let pool = WorkerPool::builtin(2);
        let out = pool
            .optimize_css(OptimizeCssInput {
                input: "a { color: red; }".into(),
                file_path: None,
                minify: true,
            })
            .await;
        assert_eq!(out.output.as_deref(), Some("a{color:red}"));
        assert!(out.diagnostics.is_empty());
    }
}
