//! Incremental program backed by an external compile command
//!
//! Each pass runs the configured `compileCommand` (if any) through the shell,
//! then re-hashes the script sources and reports only the modules whose
//! content changed since the previous pass.

use super::{CompilerService, EmittedModule, IncrementalProgram, PassOutput};
use crate::changes::{is_script_file, is_style_file};
use crate::config::{normalize, BuildConfig};
use crate::diagnostic::Diagnostic;
use crate::error::{KilnError, Result};
use crate::hasher::SourceHasher;
use crate::watch_ignore::WatchIgnore;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Default, Clone, Copy)]
pub struct CommandService;

impl CompilerService for CommandService {
    type Program = CommandProgram;

    fn create_program(&self, config: &BuildConfig) -> Result<CommandProgram> {
        if !config.src_dir.is_dir() {
            return Err(KilnError::ProgramSetup(format!(
                "source directory {} does not exist",
                config.src_dir.display()
            )));
        }
        let ignore = WatchIgnore::from_config(config);
        let hasher = SourceHasher::new(&config.src_dir)
            .with_filter(move |p: &Path| is_script_file(p) && !ignore.is_ignored(p));
        Ok(CommandProgram {
            root_dir: config.root_dir.clone(),
            command: config.compile_command.clone(),
            hasher,
            previous: HashMap::new(),
        })
    }
}

pub struct CommandProgram {
    root_dir: PathBuf,
    command: Option<String>,
    hasher: SourceHasher,
    /// Content hash per module as of the last pass
    previous: HashMap<PathBuf, String>,
}

impl IncrementalProgram for CommandProgram {
    fn emit(&mut self) -> impl Future<Output = PassOutput> + Send {
        async move {
            let mut diagnostics = Vec::new();

            if let Some(command) = &self.command {
                diagnostics.extend(run_compile_command(command, &self.root_dir).await);
            }

            let hasher = self.hasher.clone();
            let previous = self.previous.clone();
            let scanned = tokio::task::spawn_blocking(move || scan(&hasher, &previous)).await;

            let modules = match scanned {
                Ok(Ok((current, modules))) => {
                    self.previous = current;
                    modules
                }
                Ok(Err(e)) => {
                    diagnostics.push(Diagnostic::error("Scan Sources", e.to_string()));
                    Vec::new()
                }
                Err(e) => {
                    diagnostics.push(Diagnostic::error(
                        "Scan Sources",
                        format!("scan task failed: {}", e),
                    ));
                    Vec::new()
                }
            };

            debug!("Pass emitted {} module(s)", modules.len());
            PassOutput {
                modules,
                diagnostics,
            }
        }
    }

    fn invalidate(&mut self, paths: &[PathBuf]) {
        self.previous
            .retain(|module, _| !paths.iter().any(|p| module.starts_with(p)));
    }

    fn close(&mut self) {
        self.previous.clear();
    }
}

fn scan(
    hasher: &SourceHasher,
    previous: &HashMap<PathBuf, String>,
) -> anyhow::Result<(HashMap<PathBuf, String>, Vec<EmittedModule>)> {
    let files = hasher.hash_all()?;
    let changed = SourceHasher::changed_since(&files, previous);

    let current: HashMap<PathBuf, String> = files
        .iter()
        .map(|f| (f.path.clone(), f.hash.clone()))
        .collect();

    let mut modules = Vec::with_capacity(changed.len());
    for path in changed {
        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(_) => continue,
        };
        let content_hash = current.get(&path).cloned().unwrap_or_default();
        modules.push(EmittedModule {
            style_imports: extract_style_imports(&source, &path),
            source_path: path,
            content_hash,
        });
    }

    Ok((current, modules))
}

/// Run the compile command; a non-zero exit becomes error diagnostics
async fn run_compile_command(command: &str, cwd: &Path) -> Vec<Diagnostic> {
    let start = Instant::now();

    let (shell, shell_arg) = if cfg!(target_os = "windows") {
        ("cmd", "/C")
    } else {
        ("sh", "-c")
    };

    let output = Command::new(shell)
        .arg(shell_arg)
        .arg(command)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await;

    let output = match output {
        Ok(output) => output,
        Err(e) => {
            return vec![Diagnostic::error(
                "Compile",
                format!("failed to run `{}`: {}", command, e),
            )]
        }
    };

    info!(
        "`{}` exited with {} in {}ms",
        command,
        output.status,
        start.elapsed().as_millis()
    );

    if output.status.success() {
        return Vec::new();
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let text = if stderr.trim().is_empty() { stdout } else { stderr };

    let diagnostics: Vec<Diagnostic> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| Diagnostic::error("Compile", l))
        .collect();

    if diagnostics.is_empty() {
        vec![Diagnostic::error(
            "Compile",
            format!("`{}` exited with code {}", command, output.status.code().unwrap_or(-1)),
        )]
    } else {
        diagnostics
    }
}

/// Relative stylesheet specifiers quoted anywhere in `source`, resolved
/// against the directory of `file`.
pub fn extract_style_imports(source: &str, file: &Path) -> Vec<PathBuf> {
    let base = file.parent().unwrap_or_else(|| Path::new(""));
    let mut imports: Vec<PathBuf> = Vec::new();

    for line in source.lines() {
        let mut rest = line;
        while let Some(open) = rest.find(['\'', '"', '`']) {
            let quote = rest[open..].chars().next().unwrap_or('"');
            let after = &rest[open + 1..];
            let Some(close) = after.find(quote) else {
                break;
            };
            let literal = &after[..close];
            if literal.starts_with('.') && is_style_file(Path::new(literal)) {
                let resolved = normalize(&base.join(literal));
                if !imports.contains(&resolved) {
                    imports.push(resolved);
                }
            }
            rest = &after[close + 1..];
        }
    }

    imports
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn project(command: Option<&str>) -> (tempfile::TempDir, BuildConfig) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        let config = BuildConfig {
            root_dir: dir.path().to_path_buf(),
            compile_command: command.map(String::from),
            ..Default::default()
        }
        .resolve();
        (dir, config)
    }

    #[test]
    fn test_extract_style_imports() {
        let source = "import './app.css';\nconst styleUrl = \"../theme/base.scss\"; const x = 'x.ts';\n";
        let imports = extract_style_imports(source, Path::new("/proj/src/cmp/app.tsx"));
        assert_eq!(
            imports,
            vec![
                PathBuf::from("/proj/src/cmp/app.css"),
                PathBuf::from("/proj/src/theme/base.scss"),
            ]
        );
    }

    #[tokio::test]
    async fn test_emit_reports_only_changed_modules() {
        let (dir, config) = project(None);
        let app = config.src_dir.join("app.ts");
        fs::write(&app, "import './app.css';").unwrap();
        fs::write(config.src_dir.join("notes.md"), "ignored").unwrap();

        let mut program = CommandService.create_program(&config).unwrap();

        let first = program.emit().await;
        assert_eq!(first.modules.len(), 1);
        assert_eq!(first.modules[0].source_path, app);
        assert_eq!(first.modules[0].style_imports, vec![config.src_dir.join("app.css")]);

        assert!(program.emit().await.modules.is_empty());

        fs::write(&app, "export const changed = true;").unwrap();
        let third = program.emit().await;
        assert_eq!(third.modules.len(), 1);
        assert!(third.modules[0].style_imports.is_empty());
        drop(dir);
    }

    #[tokio::test]
    async fn test_invalidated_module_is_emitted_again() {
        let (_dir, config) = project(None);
        let app = config.src_dir.join("cmp/app.ts");
        fs::create_dir_all(config.src_dir.join("cmp")).unwrap();
        fs::write(&app, "export {}").unwrap();

        let mut program = CommandService.create_program(&config).unwrap();
        assert_eq!(program.emit().await.modules.len(), 1);

        // deleted and recreated with the same content between passes
        fs::remove_file(&app).unwrap();
        fs::write(&app, "export {}").unwrap();
        assert!(program.emit().await.modules.is_empty());

        program.invalidate(&[app.clone()]);
        let again = program.emit().await;
        assert_eq!(again.modules.len(), 1);
        assert_eq!(again.modules[0].source_path, app);

        // a directory path covers the files under it
        program.invalidate(&[config.src_dir.join("cmp")]);
        assert_eq!(program.emit().await.modules.len(), 1);
    }

    #[tokio::test]
    async fn test_ignored_sources_are_not_modules() {
        let (_dir, config) = project(None);
        fs::write(config.src_dir.join("app.ts"), "export {}").unwrap();
        fs::write(config.src_dir.join("app.spec.ts"), "test()").unwrap();
        fs::write(config.src_dir.join("app.e2e.ts"), "test()").unwrap();
        fs::create_dir_all(config.src_dir.join("node_modules/dep")).unwrap();
        fs::write(config.src_dir.join("node_modules/dep/index.ts"), "export {}").unwrap();

        let mut program = CommandService.create_program(&config).unwrap();
        let out = program.emit().await;
        let paths: Vec<PathBuf> = out.modules.into_iter().map(|m| m.source_path).collect();
        assert_eq!(paths, vec![config.src_dir.join("app.ts")]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_command_becomes_diagnostics() {
        let (_dir, config) = project(Some("echo 'src/app.ts: type error' 1>&2; exit 2"));
        let mut program = CommandService.create_program(&config).unwrap();

        let out = program.emit().await;
        assert_eq!(out.diagnostics.len(), 1);
        assert!(out.diagnostics[0].is_error());
        assert_eq!(out.diagnostics[0].message, "src/app.ts: type error");
    }

    #[test]
    fn test_missing_src_dir_fails_setup() {
        let dir = tempfile::tempdir().unwrap();
        let config = BuildConfig {
            root_dir: dir.path().to_path_buf(),
            ..Default::default()
        }
        .resolve();
        assert!(matches!(
            CommandService.create_program(&config),
            Err(KilnError::ProgramSetup(_))
        ));
    }
}
