//! Cloud Save CLI - Command line host for the sync engine.
//!
//! This tool drives the sync engine the way the plugin host does: it
//! triggers syncs, edits filter files, reads tool logs and registers the
//! cloud backend.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use cloudsave_common::{LogLevel, SyncWinner, TargetId};
use cloudsave_sync::{
    probe_sync_path, BackendConfig, EnginePaths, FilterKind, SyncEngine, SyncSettings,
    SyncTarget, ToolCommand, PROBE_FILE_LIMIT,
};

#[derive(Parser)]
#[command(name = "cloudsave")]
#[command(about = "Cloud Save - Sync save data with a cloud backend")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Base directory for settings, filters, runtime files and logs.
    #[arg(long, global = true)]
    base: Option<PathBuf>,

    /// Path to the external sync tool.
    #[arg(long, global = true, default_value = "rclone")]
    tool: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sync.
    Sync {
        /// Target: "global" or an application id.
        #[arg(required_unless_present = "capture")]
        target: Option<String>,

        /// Upload a single captured file instead.
        #[arg(long, conflicts_with = "target")]
        capture: Option<PathBuf>,

        /// Side that wins conflicts: "local" or "cloud".
        #[arg(short, long, default_value = "local")]
        winner: String,
    },

    /// Force a baseline resync of the global target.
    Resync {
        /// Side that wins conflicts: "local" or "cloud".
        #[arg(short, long, default_value = "local")]
        winner: String,
    },

    /// Read or replace filter files.
    Filters {
        #[command(subcommand)]
        command: FilterCommands,
    },

    /// List targets that have filters configured.
    Targets,

    /// Print the most recent tool log of a target.
    Log {
        /// Target: "global" or an application id.
        target: String,
    },

    /// Count the files a filter entry would cover.
    ProbePath {
        /// Filter entry, e.g. "/home/deck/Documents/**".
        path: String,
    },

    /// Manage the cloud backend registration.
    Backend {
        #[command(subcommand)]
        command: BackendCommands,
    },

    /// Show the effective settings.
    Settings,
}

#[derive(Subcommand)]
enum FilterCommands {
    /// Print the entries of a filter file.
    Get {
        /// Target: "global" or an application id. Omit with --shared.
        #[arg(required_unless_present = "shared")]
        target: Option<String>,

        /// Address the filter file shared by all targets.
        #[arg(long, conflicts_with = "target")]
        shared: bool,
    },

    /// Replace the entries of a filter file. No entries deletes it.
    Set {
        /// Target: "global" or an application id. Omit with --shared.
        #[arg(long, required_unless_present = "shared")]
        target: Option<String>,

        /// Address the filter file shared by all targets.
        #[arg(long, conflicts_with = "target")]
        shared: bool,

        /// Entries; "+ " or "- " sets the sign, unsigned entries include.
        entries: Vec<String>,
    },
}

#[derive(Subcommand)]
enum BackendCommands {
    /// Register a backend of the given type, wait for authorization and
    /// create the cloud destination.
    Spawn {
        /// Backend type, e.g. "drive", "onedrive", "dropbox".
        backend_type: String,

        /// Print the login URL without opening a browser.
        #[arg(long)]
        no_open: bool,
    },

    /// Show the state of the registration process.
    Probe,

    /// Show the type of the configured backend.
    Type,

    /// Create the destination directory on the backend.
    Mkdir,

    /// Delete stale bidirectional sync lock files.
    Unlock,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let base = match cli.base {
        Some(base) => base,
        None => dirs::data_dir()
            .context("Could not determine a data directory, pass --base")?
            .join("cloudsave"),
    };
    let paths = EnginePaths::under(&base);
    let settings = SyncSettings::load(settings_file(&paths))
        .await
        .context("Failed to load settings")?;

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        tracing_level(settings.log_level)
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let engine = SyncEngine::new(
        settings,
        paths,
        ToolCommand::new(&cli.tool),
        BackendConfig::default(),
    )
    .context("Failed to initialize sync engine")?;

    let result = match cli.command {
        Commands::Sync {
            target,
            capture,
            winner,
        } => cmd_sync(&engine, target.as_deref(), capture.as_deref(), &winner).await,

        Commands::Resync { winner } => cmd_resync(&engine, &winner).await,

        Commands::Filters { command } => match command {
            FilterCommands::Get { target, shared } => {
                cmd_filters_get(&engine, target.as_deref(), shared).await
            }
            FilterCommands::Set {
                target,
                shared,
                entries,
            } => cmd_filters_set(&engine, target.as_deref(), shared, &entries).await,
        },

        Commands::Targets => cmd_targets(&engine).await,

        Commands::Log { target } => cmd_log(&engine, &target).await,

        Commands::ProbePath { path } => cmd_probe_path(&engine, path).await,

        Commands::Backend { command } => match command {
            BackendCommands::Spawn {
                backend_type,
                no_open,
            } => cmd_backend_spawn(&engine, &backend_type, no_open).await,
            BackendCommands::Probe => cmd_backend_probe(&engine).await,
            BackendCommands::Type => cmd_backend_type(&engine).await,
            BackendCommands::Mkdir => cmd_backend_mkdir(&engine).await,
            BackendCommands::Unlock => cmd_backend_unlock(&engine).await,
        },

        Commands::Settings => cmd_settings(&engine),
    };

    engine.shutdown().await;
    result
}

fn settings_file(paths: &EnginePaths) -> PathBuf {
    paths.settings_dir.join("config.json")
}

fn tracing_level(level: LogLevel) -> Level {
    match level {
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Info => Level::INFO,
        LogLevel::Warning => Level::WARN,
        LogLevel::Error | LogLevel::Critical => Level::ERROR,
    }
}

fn parse_winner(winner: &str) -> Result<SyncWinner> {
    winner
        .parse()
        .context("Invalid winner. Use: local or cloud")
}

fn resolve_target(engine: &SyncEngine, target: &str) -> Result<SyncTarget> {
    let id = TargetId::parse(target).context("Invalid target")?;
    engine.target(&id).context("Failed to resolve target")
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

/// Run a sync of a target or a captured file.
async fn cmd_sync(
    engine: &SyncEngine,
    target: Option<&str>,
    capture: Option<&Path>,
    winner: &str,
) -> Result<ExitCode> {
    let winner = parse_winner(winner)?;
    let target = match (target, capture) {
        (_, Some(path)) => engine
            .capture_target(path)
            .context("Invalid capture path")?,
        (Some(target), None) => resolve_target(engine, target)?,
        (None, None) => anyhow::bail!("Either a target or --capture is required"),
    };

    info!("Syncing {} ({} mode)", target.id(), target.mode());
    let outcome = engine.sync(&target, winner).await;

    println!("Sync finished with exit code {}", outcome.exit_code);
    if let Some(log_path) = &outcome.log_path {
        println!("  Log: {}", log_path.display());
    }

    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        exit_code(outcome.exit_code)
    })
}

/// Force a resync of the global target.
async fn cmd_resync(engine: &SyncEngine, winner: &str) -> Result<ExitCode> {
    let winner = parse_winner(winner)?;
    let target = engine.global_target();

    info!("Resyncing {} with {} winning", target.id(), winner);
    let outcome = engine.resync(&target, winner).await;

    println!("Resync finished with exit code {}", outcome.exit_code);
    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        exit_code(outcome.exit_code)
    })
}

fn filter_kind(target: Option<&str>, shared: bool) -> Result<Option<TargetId>> {
    if shared {
        return Ok(None);
    }
    let target = target.context("Either a target or --shared is required")?;
    Ok(Some(TargetId::parse(target).context("Invalid target")?))
}

/// Print a filter file.
async fn cmd_filters_get(
    engine: &SyncEngine,
    target: Option<&str>,
    shared: bool,
) -> Result<ExitCode> {
    let id = filter_kind(target, shared)?;
    let kind = id.as_ref().map_or(FilterKind::Shared, FilterKind::Target);

    let entries = engine
        .get_filters(kind)
        .await
        .context("Failed to read filters")?;

    if entries.is_empty() {
        println!("No filters configured.");
    } else {
        for entry in entries {
            println!("{}", entry);
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Replace a filter file.
async fn cmd_filters_set(
    engine: &SyncEngine,
    target: Option<&str>,
    shared: bool,
    entries: &[String],
) -> Result<ExitCode> {
    let id = filter_kind(target, shared)?;
    let kind = id.as_ref().map_or(FilterKind::Shared, FilterKind::Target);

    engine
        .set_filters(kind, entries)
        .await
        .context("Failed to write filters")?;

    if entries.is_empty() {
        println!("Filters removed.");
    } else {
        println!("Filters updated: {} entries", entries.len());
    }

    Ok(ExitCode::SUCCESS)
}

/// List targets with filters.
async fn cmd_targets(engine: &SyncEngine) -> Result<ExitCode> {
    let ids = engine
        .available_targets()
        .await
        .context("Failed to list targets")?;

    if ids.is_empty() {
        println!("No targets configured.");
    } else {
        for id in ids {
            let running = if engine.guard().is_running(&id) {
                " (syncing)"
            } else {
                ""
            };
            println!("  {}{}", id, running);
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Print the last tool log of a target.
async fn cmd_log(engine: &SyncEngine, target: &str) -> Result<ExitCode> {
    let target = resolve_target(engine, target)?;
    println!("{}", engine.last_sync_log(&target).await);
    Ok(ExitCode::SUCCESS)
}

/// Count files a filter entry covers.
async fn cmd_probe_path(engine: &SyncEngine, path: String) -> Result<ExitCode> {
    let sync_root = engine.settings().sync_root.clone();
    let pattern = path.clone();
    let count = tokio::task::spawn_blocking(move || probe_sync_path(&sync_root, &pattern))
        .await
        .context("Path probe task failed")?
        .context("Failed to probe path")?;

    match count {
        -1 => println!(
            "More than {} files, choose a narrower path.",
            PROBE_FILE_LIMIT
        ),
        0 => println!("Nothing to sync at {}", path),
        n => println!("{} file(s) would be synced", n),
    }

    Ok(ExitCode::SUCCESS)
}

/// Register a backend and wait until the user completes authorization.
async fn cmd_backend_spawn(
    engine: &SyncEngine,
    backend_type: &str,
    no_open: bool,
) -> Result<ExitCode> {
    let backend = engine.backend();
    let url = backend
        .spawn(backend_type)
        .await
        .context("Failed to start backend registration")?;

    if url.is_empty() {
        anyhow::bail!("The sync tool did not provide a login URL, try again");
    }

    println!("Log in at: {}", url);
    if !no_open {
        if let Err(e) = open::that(&url) {
            println!("Could not open a browser ({}), open the URL manually.", e);
        }
    }

    println!("Waiting for authorization...");
    loop {
        if let Some(code) = backend.probe().await? {
            if code == 0 {
                println!("Backend configured: {}", backend.backend_type().await);
                return cmd_backend_mkdir(engine).await;
            }
            println!("Registration failed with exit code {}", code);
            return Ok(exit_code(code));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// Show the registration process state.
async fn cmd_backend_probe(engine: &SyncEngine) -> Result<ExitCode> {
    match engine.backend().probe().await? {
        Some(code) => println!("No registration running (last exit code {})", code),
        None => println!("Waiting for authorization"),
    }
    Ok(ExitCode::SUCCESS)
}

/// Show the configured backend type.
async fn cmd_backend_type(engine: &SyncEngine) -> Result<ExitCode> {
    let backend_type = engine.backend().backend_type().await;
    if backend_type.is_empty() {
        println!("No backend configured.");
    } else {
        println!("Backend: {}", backend_type);
    }
    Ok(ExitCode::SUCCESS)
}

/// Create the destination directory on the backend.
async fn cmd_backend_mkdir(engine: &SyncEngine) -> Result<ExitCode> {
    let code = engine
        .create_destination()
        .await
        .context("Failed to create cloud destination")?;

    if code == 0 {
        println!(
            "Cloud destination ready: {}",
            engine.settings().destination_directory
        );
        Ok(ExitCode::SUCCESS)
    } else {
        println!("Creating the cloud destination failed with exit code {}", code);
        Ok(exit_code(code))
    }
}

/// Remove stale lock files.
async fn cmd_backend_unlock(engine: &SyncEngine) -> Result<ExitCode> {
    let removed = engine
        .backend()
        .delete_lock_files()
        .await
        .context("Failed to delete lock files")?;
    println!("Removed {} lock file(s)", removed);
    Ok(ExitCode::SUCCESS)
}

/// Print the effective settings.
fn cmd_settings(engine: &SyncEngine) -> Result<ExitCode> {
    let json = serde_json::to_string_pretty(engine.settings())?;
    println!("{}", json);
    println!();
    println!("Settings file: {}", settings_file(engine.paths()).display());
    Ok(ExitCode::SUCCESS)
}
