//! Kiln CLI - Incremental build engine
//!
//! Commands:
//! - kiln watch          - Watch sources and rebuild incrementally
//! - kiln build          - Run a single full build
//! - kiln cache stats    - Show transform cache statistics
//! - kiln cache clear    - Drop every cached transform
//! - kiln config         - Print the resolved configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kiln_core::program::IncrementalProgram;
use kiln_core::{
    build, BuildConfig, BuildContext, BuildEvent, BuildResults, Cache, ChangeSet, CommandService,
    CompilerCtx, CompilerService, Diagnostic, Level,
};
use kiln_daemon::{NotifyAdapter, WatchSession};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Kiln - Incremental build engine
#[derive(Parser)]
#[command(name = "kiln", version, about = "Incremental build engine")]
struct Cli {
    /// Project root (defaults to the current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Verbose logging, including per-cycle change lists
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the source tree and rebuild on change
    Watch {
        /// Print build events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Run one full build and exit
    Build,
    /// Transform cache management
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Print the resolved configuration
    Config,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show entry count and size on disk
    Stats,
    /// Remove every entry
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir()?,
    };
    let mut config = load_config(&root)?;
    config.flags.debug |= cli.debug;
    init_tracing(config.flags.debug);

    let code = match cli.command {
        Commands::Watch { json } => watch(config, json).await?,
        Commands::Build => run_build(config).await?,
        Commands::Cache { action } => {
            cache_command(&config, action)?;
            0
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            0
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn init_tracing(debug: bool) {
    let default = if debug { "kiln=debug,kiln_core=debug,kiln_daemon=debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with_target(false)
        .init();
}

fn load_config(root: &Path) -> Result<BuildConfig> {
    BuildConfig::load(root).with_context(|| format!("failed to load config from {}", root.display()))
}

async fn watch(config: BuildConfig, json: bool) -> Result<i32> {
    println!("👀 kiln watch {}", config.src_dir.display());

    let ctx = CompilerCtx::from_config(&config)?;
    let adapter = Arc::new(NotifyAdapter::new()?);
    let session = WatchSession::start(config, adapter, CommandService, ctx)?;

    session.events().on_any(move |event| {
        if json {
            println!("{}", event.to_json());
            return;
        }
        match event {
            BuildEvent::FsChange(changes) => {
                debug!("{} file(s) changed", changes.files_changed().len());
            }
            BuildEvent::BuildFinish(results) => print_results(results),
            BuildEvent::BuildStart { .. } | BuildEvent::BuildLog { .. } => {}
        }
    });

    session.ready().await;
    info!("Watching for changes (Ctrl-C to stop)");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!("🛑 Stopping...");
        }
        _ = session.wait() => {}
    }

    let results = session.close().await;
    Ok(results.exit_code)
}

async fn run_build(config: BuildConfig) -> Result<i32> {
    println!("🔨 kiln build {}", config.root_dir.display());

    let mut ctx = CompilerCtx::from_config(&config)?;
    let mut program = CommandService.create_program(&config)?;

    let pass = program.emit().await;
    let build_id = ctx.next_build_id();
    let mut build_ctx = BuildContext::new(&config, ChangeSet::default(), false, build_id);
    build_ctx.start();
    let results = build(&config, &mut ctx, &mut build_ctx, pass).await;
    program.close();

    print_results(&results);
    let stats = ctx.cache.stats();
    println!("   Cache: {} hit(s), {} miss(es)", stats.hits, stats.misses);

    Ok(if results.has_error { 1 } else { 0 })
}

fn print_results(results: &BuildResults) {
    for diagnostic in &results.diagnostics {
        print_diagnostic(diagnostic);
    }
    if results.has_error {
        println!("❌ Build {} failed in {}ms", results.build_id, results.duration_ms);
    } else {
        println!(
            "✅ Build {} finished in {}ms ({} module(s), {} style(s))",
            results.build_id, results.duration_ms, results.modules_updated, results.styles_optimized
        );
    }
}

fn print_diagnostic(diagnostic: &Diagnostic) {
    let marker = match diagnostic.level {
        Level::Error => "error",
        Level::Warn => "warn",
        Level::Info => "info",
    };
    match &diagnostic.file {
        Some(file) => println!(
            "   [{}] {}: {} ({})",
            marker,
            diagnostic.header,
            diagnostic.message,
            file.display()
        ),
        None => println!("   [{}] {}: {}", marker, diagnostic.header, diagnostic.message),
    }
}

fn cache_command(config: &BuildConfig, action: CacheAction) -> Result<()> {
    let cache = Cache::open(&config.cache_dir)?;
    match action {
        CacheAction::Stats => {
            let stats = cache.stats();
            println!("📊 Cache at {}", config.cache_dir.display());
            println!("   Entries: {}", stats.entries);
            println!("   Size on disk: {} bytes", stats.size_on_disk);
        }
        CacheAction::Clear => {
            cache.clear()?;
            println!("🗑️  Cache cleared!");
        }
    }
    Ok(())
}
