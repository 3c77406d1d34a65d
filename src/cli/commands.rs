//! CLI command definitions for scribe_forge.
//!
//! Every command opens the same SQLite database: artifact records and the
//! local task registry share one pool. Only `run` recovers interrupted tasks
//! and starts the dispatcher and the event loop; the other commands queue
//! work or inspect state and exit.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use crate::artifact::Artifact;
use crate::metrics::{export_metrics, init_metrics};
use crate::pipeline::{PipelineConfig, PipelineService};
use crate::registry::LocalTaskRegistry;
use crate::storage::{connect, SqliteRecordStore};
use crate::upload::TextUploader;

/// Durable transcription, summary and titling pipeline for recordings.
#[derive(Parser)]
#[command(name = "scribe-forge")]
#[command(about = "Transcribe, summarize and title recordings through a durable task pipeline")]
#[command(version)]
#[command(
    long_about = "scribe-forge drives captured recordings through transcription, summarization and title generation.\n\nStage requests are persisted and executed by a local task registry, so work survives restarts.\n\nExample usage:\n  scribe-forge ingest ./lesson-12.m4a --title \"Lesson 12\"\n  scribe-forge run"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// SQLite database file. Overrides SCRIBE_DATABASE_PATH.
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Reconcile, then execute tasks and handle their results until Ctrl-C.
    Run(RunArgs),

    /// Record a new recording and queue its transcription.
    Ingest(IngestArgs),

    /// List artifacts, or show one in full.
    Status(StatusArgs),

    /// Resubmit the first unfinished stage of a pending or failed artifact.
    Retry(IdArgs),

    /// Set an artifact's title and protect it from generated titles.
    Rename(RenameArgs),

    /// Cancel an artifact's tasks and delete its record.
    Delete(IdArgs),

    /// Reconcile the registry against the record store once.
    Reconcile,

    /// Upload an artifact's document to the secondary store.
    Upload(IdArgs),
}

/// Arguments for `scribe-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Print Prometheus metrics on shutdown.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for `scribe-forge ingest`.
#[derive(Parser, Debug)]
pub struct IngestArgs {
    /// Path to the recorded audio file.
    pub path: PathBuf,

    /// Initial title. Defaults to the file name.
    #[arg(short, long)]
    pub title: Option<String>,
}

/// Arguments for `scribe-forge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Artifact to show. Lists all artifacts when omitted.
    pub id: Option<String>,

    /// Output JSON instead of text.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// A single artifact id.
#[derive(Parser, Debug)]
pub struct IdArgs {
    /// Artifact id.
    pub id: String,
}

/// Arguments for `scribe-forge rename`.
#[derive(Parser, Debug)]
pub struct RenameArgs {
    /// Artifact id.
    pub id: String,

    /// New title.
    pub title: String,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config = PipelineConfig::from_env().context("Invalid configuration")?;
    if let Some(path) = cli.database {
        config = config.with_database_path(path);
    }

    match cli.command {
        Commands::Run(args) => run_service_command(config, args).await,
        Commands::Ingest(args) => run_ingest_command(config, args).await,
        Commands::Status(args) => run_status_command(config, args).await,
        Commands::Retry(args) => run_retry_command(config, args).await,
        Commands::Rename(args) => run_rename_command(config, args).await,
        Commands::Delete(args) => run_delete_command(config, args).await,
        Commands::Reconcile => run_reconcile_command(config).await,
        Commands::Upload(args) => run_upload_command(config, args).await,
    }
}

/// Opens the database, the record store and the local registry.
async fn open_pipeline(
    config: PipelineConfig,
) -> anyhow::Result<(PipelineService, Arc<LocalTaskRegistry>)> {
    let path = config.database_path.to_string_lossy().to_string();
    let pool = connect(&path)
        .await
        .with_context(|| format!("Failed to open database {}", path))?;

    let store = Arc::new(SqliteRecordStore::new(pool.clone()).await?);
    let registry = Arc::new(
        LocalTaskRegistry::open(pool)
            .await?
            .with_poll_interval(config.dispatch_poll_interval),
    );

    let service = PipelineService::new(config, store, registry.clone());
    Ok((service, registry))
}

async fn run_service_command(config: PipelineConfig, args: RunArgs) -> anyhow::Result<()> {
    init_metrics().context("Failed to register metrics")?;

    let (service, registry) = open_pipeline(config).await?;
    // This process owns the dispatcher, so rows still `running` are orphaned.
    registry
        .recover_interrupted()
        .await
        .context("Failed to recover interrupted tasks")?;
    let report = service.start().await?;
    println!("Reconciled: {}", report);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let dispatcher = registry.spawn_dispatcher(shutdown_rx);
    info!("scribe-forge running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    // Ignore send error - the dispatcher may have already stopped
    let _ = shutdown_tx.send(());
    if let Err(e) = dispatcher.await {
        tracing::error!(error = %e, "Dispatcher panicked during shutdown");
    }
    service.stop().await?;

    if args.metrics {
        print!("{}", export_metrics());
    }
    Ok(())
}

async fn run_ingest_command(config: PipelineConfig, args: IngestArgs) -> anyhow::Result<()> {
    if !args.path.is_file() {
        anyhow::bail!("Recording does not exist: {}", args.path.display());
    }
    let path = std::fs::canonicalize(&args.path)
        .with_context(|| format!("Failed to resolve {}", args.path.display()))?;
    let title = args.title.unwrap_or_else(|| {
        path.file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "Recording".to_string())
    });

    let (service, _registry) = open_pipeline(config).await?;
    let (artifact, task_id) = service.ingest(title, path).await?;
    println!(
        "Ingested {} ({}), transcription queued as {}",
        artifact.id, artifact.title, task_id
    );
    Ok(())
}

#[derive(Debug, Serialize)]
struct StatusEntry<'a> {
    id: &'a str,
    title: &'a str,
    status: &'a str,
    title_locked: bool,
    has_transcript: bool,
    has_summary: bool,
    updated_at: String,
}

impl<'a> From<&'a Artifact> for StatusEntry<'a> {
    fn from(a: &'a Artifact) -> Self {
        Self {
            id: &a.id,
            title: &a.title,
            status: a.pipeline_status.as_str(),
            title_locked: a.title_user_locked,
            has_transcript: a.transcript.is_some(),
            has_summary: a.summary.is_some(),
            updated_at: a.updated_at.to_rfc3339(),
        }
    }
}

async fn run_status_command(config: PipelineConfig, args: StatusArgs) -> anyhow::Result<()> {
    let (service, _registry) = open_pipeline(config).await?;

    let Some(id) = args.id else {
        let artifacts = service.list().await?;
        if args.json {
            let entries: Vec<StatusEntry<'_>> = artifacts.iter().map(StatusEntry::from).collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        } else if artifacts.is_empty() {
            println!("No artifacts");
        } else {
            for a in &artifacts {
                println!("{:<38} {:<11} {}", a.id, a.pipeline_status.as_str(), a.title);
            }
        }
        return Ok(());
    };

    let artifact = service.get(&id).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&artifact)?);
        return Ok(());
    }

    println!("ID:       {}", artifact.id);
    println!("Title:    {}{}", artifact.title, if artifact.title_user_locked { " (locked)" } else { "" });
    println!("Status:   {}", artifact.pipeline_status);
    println!("Source:   {}", artifact.source_file_path.display());
    println!("Created:  {}", artifact.created_at.to_rfc3339());
    println!("Updated:  {}", artifact.updated_at.to_rfc3339());
    if let Some(summary) = &artifact.summary {
        println!("\nSummary:\n{}", summary);
    }
    if let Some(transcript) = &artifact.transcript {
        println!("\nTranscript:\n{}", transcript);
    }
    Ok(())
}

async fn run_retry_command(config: PipelineConfig, args: IdArgs) -> anyhow::Result<()> {
    let (service, _registry) = open_pipeline(config).await?;
    let (stage, task_id) = service.retry(&args.id).await?;
    println!("Resubmitted {} for {} as {}", stage, args.id, task_id);
    Ok(())
}

async fn run_rename_command(config: PipelineConfig, args: RenameArgs) -> anyhow::Result<()> {
    let (service, _registry) = open_pipeline(config).await?;
    let artifact = service.rename(&args.id, &args.title).await?;
    println!("Renamed {} to \"{}\"", artifact.id, artifact.title);
    Ok(())
}

async fn run_delete_command(config: PipelineConfig, args: IdArgs) -> anyhow::Result<()> {
    let (service, _registry) = open_pipeline(config).await?;
    service.delete(&args.id).await?;
    println!("Deleted {}", args.id);
    Ok(())
}

async fn run_reconcile_command(config: PipelineConfig) -> anyhow::Result<()> {
    let (service, _registry) = open_pipeline(config).await?;
    let report = service.reconcile().await?;
    println!("Reconciled: {}", report);
    Ok(())
}

async fn run_upload_command(config: PipelineConfig, args: IdArgs) -> anyhow::Result<()> {
    let uploader = TextUploader::from_config(&config)?;
    let (service, _registry) = open_pipeline(config).await?;
    let artifact = service.get(&args.id).await?;
    let response = uploader.upload_artifact(&artifact).await?;
    println!("Uploaded {}", args.id);
    if !response.trim().is_empty() {
        println!("{}", response.trim());
    }
    Ok(())
}
