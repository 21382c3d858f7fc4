use anyhow::{Context, Result};
use backup_mirror::utils::{logging, LogBuffer};
use backup_mirror::{BackupConfig, BackupOrchestrator, RunEvent, RunOptions, RunOutcome, Settings};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "backup-mirror", version, about = "Mirror directory trees into a backup destination")]
struct Cli {
    /// Engine settings file (TOML, JSON or YAML)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Directory holding backup configurations
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List saved backup configurations
    List,

    /// Create or replace a backup configuration
    Init {
        name: String,

        #[arg(long = "source", required = true)]
        sources: Vec<PathBuf>,

        #[arg(long = "exclude")]
        excludes: Vec<String>,

        #[arg(long)]
        dest: Option<PathBuf>,
    },

    /// Run a backup by configuration name or file path
    Run {
        config: String,

        /// Destination for this run only
        #[arg(long)]
        dest: Option<PathBuf>,

        #[arg(long)]
        workers: Option<usize>,

        /// Scan and plan without changing anything
        #[arg(long)]
        dry_run: bool,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.settings.as_deref())?;
    if let Some(dir) = cli.config_dir {
        settings.config_dir = dir;
    }
    logging::init_tracing(&settings.log_filter, settings.log_json);

    match cli.command {
        Commands::List => list(&settings),
        Commands::Init {
            name,
            sources,
            excludes,
            dest,
        } => {
            let config = BackupConfig {
                name,
                sources,
                excludes,
                destination: dest,
            };
            let path = config.save(&settings.config_dir)?;
            println!("{}", path.display());
            Ok(())
        }
        Commands::Run {
            config,
            dest,
            workers,
            dry_run,
            json,
        } => {
            let config = BackupConfig::find(&settings.config_dir, &config)
                .with_context(|| format!("cannot load configuration '{}'", config))?;
            let options = RunOptions {
                dry_run,
                max_workers: workers,
            };
            run(settings, config, dest, options, json).await
        }
    }
}

fn list(settings: &Settings) -> Result<()> {
    let configs = BackupConfig::discover(&settings.config_dir)?;
    if configs.is_empty() {
        println!("No configurations in {}", settings.config_dir.display());
    }
    for config in configs {
        let dest = config
            .destination
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{}\t{} sources\t{}", config.name, config.sources.len(), dest);
    }
    Ok(())
}

async fn run(
    settings: Settings,
    config: BackupConfig,
    dest: Option<PathBuf>,
    options: RunOptions,
    json: bool,
) -> Result<()> {
    let orchestrator = BackupOrchestrator::new(settings);
    let handle = orchestrator.start(config, dest, options)?;
    info!("Run {} started", handle.id());

    let stopper = orchestrator.clone();
    let signals = tokio::spawn(async move {
        shutdown_signal().await;
        if stopper.stop() {
            eprintln!("Stopping after in-flight copies finish...");
        }
    });

    let log_buffer = LogBuffer::new(1000);
    let (mut events, task) = handle.into_parts();
    while let Some(event) = events.next().await {
        log_buffer.record(&event);
        if json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            print_event(&event);
        }
    }
    signals.abort();

    let outcome = task.await.context("backup task aborted")?;
    let problems = log_buffer.recent_problems(20);
    if !problems.is_empty() && !json {
        eprintln!("Recent warnings:");
        for entry in problems {
            match entry.path {
                Some(path) => eprintln!("  {}: {}", path, entry.message),
                None => eprintln!("  {}", entry.message),
            }
        }
    }

    if let RunOutcome::Failed { message } = outcome {
        anyhow::bail!("backup failed: {}", message);
    }
    Ok(())
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::Planned { summary } => println!(
            "Plan: {} directories, {} files ({} bytes), {} symlinks, {} deletions, {} unchanged",
            summary.create_dirs,
            summary.copies,
            summary.copy_bytes,
            summary.symlinks,
            summary.deletes,
            summary.skips
        ),
        RunEvent::Copied { path, bytes } => println!("copied   {} ({} bytes)", path.display(), bytes),
        RunEvent::SymlinkCreated { path, target } => {
            println!("linked   {} -> {}", path.display(), target.display())
        }
        RunEvent::DirectoryCreated { path } => println!("mkdir    {}", path.display()),
        RunEvent::Deleted { path, reversible } => println!(
            "{} {}",
            if *reversible { "trashed " } else { "deleted " },
            path.display()
        ),
        RunEvent::Info { message } => println!("{}", message),
        RunEvent::Warning { message, .. } => eprintln!("warning: {}", message),
        RunEvent::Finished { summary } | RunEvent::Stopped { summary } => println!(
            "{}: {} copied ({} bytes), {} deleted, {} unchanged, {} warnings in {}",
            if matches!(event, RunEvent::Stopped { .. }) {
                "Stopped"
            } else {
                "Finished"
            },
            summary.files_copied,
            summary.bytes_copied,
            summary.deleted,
            summary.skipped,
            summary.warnings,
            humantime::format_duration(Duration::from_millis(summary.elapsed_ms))
        ),
        RunEvent::Failed { message } => eprintln!("failed: {}", message),
        RunEvent::StateChanged { .. } | RunEvent::Skipped { .. } | RunEvent::Progress { .. } => {}
    }
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
