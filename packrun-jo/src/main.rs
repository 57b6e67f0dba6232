//! packrun-jo - Job status orchestrator CLI
//!
//! Watches Sources through extraction, the credit gate and analysis,
//! persisting progress so an interrupted run can be resumed.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use packrun_common::config::{
    default_config_path, load_toml_config, LoggingConfig, RootFolderInitializer, RootFolderResolver,
    TomlConfig,
};
use packrun_common::events::EventBus;
use packrun_common::human_time::{format_duration, format_eta};
use packrun_common::{PackId, SourceId};
use packrun_jo::{
    ApiSettings, HttpPipelineClient, JobOrchestrator, OrchestratorEvent, OrchestratorSettings,
    SessionStore, StartResult, MODULE_NAME,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "packrun-jo", version, about = "Track Sources through the processing pipeline")]
struct Cli {
    /// Root folder holding packrun.db
    #[arg(long, global = true)]
    root_folder: Option<PathBuf>,

    /// Backend base URL (overrides PACKRUN_API_URL and the config file)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Track a freshly uploaded Source until it settles
    Watch {
        source_id: String,
        /// Pack the Source belongs to
        #[arg(long)]
        pack: Option<String>,
        /// Start analysis as soon as the credit gate allows it
        #[arg(long)]
        auto_confirm: bool,
        /// Analyze at most this many units
        #[arg(long)]
        max_units: Option<u64>,
    },
    /// Resume polling for every Source in the saved session
    Resume {
        #[arg(long)]
        auto_confirm: bool,
        #[arg(long)]
        max_units: Option<u64>,
    },
    /// Cancel processing of a Source
    Cancel { source_id: String },
    /// Show the saved session
    Status,
    /// Forget the saved session
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().or_else(|| default_config_path(MODULE_NAME));
    let (toml_config, config_problem) = match config_path.as_deref() {
        Some(path) if path.exists() => match load_toml_config(path) {
            Ok(config) => (config, None),
            Err(e) => (TomlConfig::default(), Some(e.to_string())),
        },
        _ => (TomlConfig::default(), None),
    };

    init_logging(&toml_config.logging)?;
    if let Some(problem) = config_problem {
        warn!("{}; using compiled defaults", problem);
    }

    info!(
        "packrun-jo {} ({}, built {}, {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let mut resolver = RootFolderResolver::new(MODULE_NAME).with_cli_arg(cli.root_folder.clone());
    if let Some(path) = cli.config.clone() {
        resolver = resolver.with_config_path(path);
    }
    let initializer = RootFolderInitializer::new(resolver.resolve());
    initializer
        .ensure_directory_exists()
        .context("Failed to initialize root folder")?;
    let db_path = initializer.database_path();
    info!("Database: {}", db_path.display());

    let settings = OrchestratorSettings::from_toml(&toml_config.orchestrator);
    let store = SessionStore::open(&db_path, settings.session_debounce).await?;

    match cli.command {
        Command::Status => {
            let result = print_status(&store).await;
            store.close().await?;
            result
        }
        Command::Reset => {
            store.clear().await?;
            store.close().await?;
            println!("Session cleared");
            Ok(())
        }
        command => {
            let api = ApiSettings::resolve(cli.api_url.as_deref(), &toml_config)?;
            info!("Backend: {}", api.base_url);
            let client = HttpPipelineClient::new(api)?;
            let mut orchestrator =
                JobOrchestrator::new(Arc::new(client), store, EventBus::new(100), settings);

            let result = run(&mut orchestrator, command).await;
            orchestrator.shutdown().await?;
            result
        }
    }
}

async fn run(orchestrator: &mut JobOrchestrator, command: Command) -> Result<()> {
    match command {
        Command::Watch {
            source_id,
            pack,
            auto_confirm,
            max_units,
        } => {
            let source_id = SourceId::new(source_id);
            orchestrator.restore().await?;
            let known_active = orchestrator
                .source(&source_id)
                .is_some_and(|s| !s.stage.is_terminal());
            if known_active {
                orchestrator.retry(&source_id)?;
            } else {
                orchestrator.track_submitted(source_id, pack.map(PackId::new))?;
            }
            drive(orchestrator, auto_confirm, max_units).await
        }
        Command::Resume {
            auto_confirm,
            max_units,
        } => {
            let resumed = orchestrator.resume().await?;
            if resumed.is_empty() {
                println!("Nothing to resume");
                return Ok(());
            }
            println!("Resumed {} source(s)", resumed.len());
            drive(orchestrator, auto_confirm, max_units).await
        }
        Command::Cancel { source_id } => {
            let source_id = SourceId::new(source_id);
            orchestrator.restore().await?;
            let outcome = orchestrator.cancel(&source_id).await?;
            println!("{}: {}", source_id, outcome.label());
            Ok(())
        }
        Command::Status | Command::Reset => Ok(()),
    }
}

/// Process events until nothing is polling or the user interrupts
async fn drive(orchestrator: &mut JobOrchestrator, auto_confirm: bool, max_units: Option<u64>) -> Result<()> {
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    while orchestrator.has_active_polling() {
        let event = tokio::select! {
            event = orchestrator.next_event() => event?,
            _ = &mut shutdown => return Ok(()),
        };
        print_event(&event);

        if let OrchestratorEvent::CreditGateOpened { source_id, check } = &event {
            if !auto_confirm {
                println!("{}: run `resume --auto-confirm` to start analysis", source_id);
                continue;
            }
            if !check.can_proceed {
                continue;
            }
            let result = tokio::select! {
                result = orchestrator.confirm_analysis(source_id, max_units) => result?,
                _ = &mut shutdown => return Ok(()),
            };
            match result {
                StartResult::Started { job_id, units } => {
                    println!("{}: analysis started on {} units (job {})", source_id, units, job_id)
                }
                StartResult::Denied { check } => {
                    println!("{}: {} more credits needed", source_id, check.credits_needed)
                }
                StartResult::NothingToAnalyze => println!("{}: nothing to analyze", source_id),
                StartResult::GateReopened { check, detail } => println!(
                    "{}: analysis refused ({}); {} units allowed now",
                    source_id, detail, check.allowed_units
                ),
            }
        }
    }
    Ok(())
}

/// Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
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
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, saving session"),
        _ = terminate => info!("Received terminate signal, saving session"),
    }
}

fn print_event(event: &OrchestratorEvent) {
    match event {
        OrchestratorEvent::StageChanged { source_id, from, to } => {
            println!("{}: {} → {}", source_id, from, to)
        }
        OrchestratorEvent::Progress {
            source_id,
            stage,
            progress,
            processed_units,
            total_units,
        } => match total_units {
            Some(total) => println!(
                "{}: {} {}% ({}/{} units)",
                source_id, stage, progress, processed_units, total
            ),
            None => println!("{}: {} {}%", source_id, stage, progress),
        },
        OrchestratorEvent::Connection {
            source_id,
            status,
            consecutive_failures,
            next_retry,
        } => match next_retry {
            Some(delay) => println!(
                "{}: connection {} ({} failures, retry in {})",
                source_id,
                status,
                consecutive_failures,
                format_duration(delay.as_secs())
            ),
            None => println!("{}: connection {}", source_id, status),
        },
        OrchestratorEvent::CreditGateOpened { source_id, check } => println!(
            "{}: ready, {} units, {} allowed, {} credits needed",
            source_id, check.total_units, check.allowed_units, check.credits_needed
        ),
        OrchestratorEvent::NothingToAnalyze { source_id } => {
            println!("{}: nothing to analyze", source_id)
        }
        OrchestratorEvent::TimedOut {
            source_id,
            stage,
            elapsed,
        } => println!(
            "{}: still {} after {}, check back later",
            source_id,
            stage,
            format_duration(elapsed.as_secs())
        ),
        OrchestratorEvent::AuthRequired { source_id } => {
            println!("{}: authentication required, refresh the token and resume", source_id)
        }
        OrchestratorEvent::PollingEnded { source_id, outcome } => {
            println!("{}: polling ended ({:?})", source_id, outcome)
        }
    }
}

async fn print_status(store: &SessionStore) -> Result<()> {
    let Some(snapshot) = store.load().await? else {
        println!("No saved session");
        return Ok(());
    };

    println!("Saved {}", snapshot.saved_at.to_rfc3339());
    for session in &snapshot.sessions {
        let units = session
            .total_units
            .map(|total| format!("{}/{}", session.processed_units, total))
            .unwrap_or_else(|| "-".to_string());
        let job = session.job_id.as_ref().map(|j| j.as_str()).unwrap_or("-");
        println!(
            "{:<24} {:<20} {:>3}% {:>10} job {:<24} eta {}",
            session.source_id,
            session.stage,
            session.progress,
            units,
            job,
            format_eta(session.estimated_seconds)
        );
    }

    let tail = snapshot.log_tail.len().saturating_sub(10);
    for entry in &snapshot.log_tail[tail..] {
        let source = entry.source_id.as_ref().map(|s| s.as_str()).unwrap_or("-");
        println!(
            "{} {:<5} {} {}",
            entry.at.format("%H:%M:%S"),
            entry.level.as_str(),
            source,
            entry.message
        );
    }
    Ok(())
}

/// `RUST_LOG` wins over the configured level
fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match &logging.log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}
