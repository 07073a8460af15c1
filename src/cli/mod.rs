//! Command-line interface for dispatch-ingest.
//!
//! Provides commands for running the ingestion daemon, processing a
//! single recording, inspecting call records, and maintaining the
//! database.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fs2::FileExt;

use crate::config::{self, Settings};
use crate::core::{Admission, CallStore, Orchestrator, ProcessRequest};
use crate::domain::{CallRecord, CallStatus, JobSource, ProcessOptions, TranscriptFormat, TranscriptionMode};
use crate::ingest::{CallSink, CallWatcher, WatcherConfig};

/// How often one-shot commands check whether their work has finished
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// dispatch-ingest - Emergency dispatch audio ingestion
#[derive(Parser, Debug)]
#[command(name = "dispatch-ingest")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: discovered .dispatch-ingest/config.yaml)
    #[arg(long, global = true, env = "DISPATCH_INGEST_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch the calls directory and process recordings until Ctrl+C
    Serve {
        /// Skip the initial scan of recordings already present
        #[arg(long)]
        no_scan: bool,
    },

    /// Process one recording and wait for the result
    Process {
        /// File name inside the calls directory
        filename: String,

        /// Reprocess even if the call is done or in flight
        #[arg(short, long)]
        force: bool,

        /// Speech model override
        #[arg(long)]
        model: Option<String>,

        /// transcribe or translate
        #[arg(long, default_value = "transcribe")]
        mode: TranscriptionMode,

        /// json, text or diarized_json
        #[arg(long, default_value = "json")]
        format: TranscriptFormat,

        /// Send alerts for the result
        #[arg(long)]
        notify: bool,
    },

    /// Show the record for a call
    Status {
        filename: String,

        /// Print the full record as JSON
        #[arg(long)]
        json: bool,
    },

    /// List recent calls
    List {
        /// Only calls in this status
        #[arg(short, long)]
        status: Option<CallStatus>,

        /// Maximum number of calls to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show calls stuck in queued or processing
    Stale {
        /// Age threshold in seconds (default: queue.stale_after_secs)
        #[arg(long)]
        older_than: Option<u64>,
    },

    /// Re-request stale queued calls and wait for them
    Reconcile {
        /// Age threshold in seconds (default: queue.stale_after_secs)
        #[arg(long)]
        older_than: Option<u64>,
    },

    /// Apply pending database migrations
    Migrate,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let settings = config::init(self.config.as_deref())?.clone();

        match self.command {
            Commands::Serve { no_scan } => serve(settings, !no_scan).await,
            Commands::Process {
                filename,
                force,
                model,
                mode,
                format,
                notify,
            } => {
                let options = ProcessOptions {
                    model,
                    mode,
                    format,
                };
                process_one(settings, &filename, force, notify, options).await
            }
            Commands::Status { filename, json } => show_status(&settings, &filename, json),
            Commands::List { status, limit } => list_calls(&settings, status, limit),
            Commands::Stale { older_than } => show_stale(&settings, older_than),
            Commands::Reconcile { older_than } => reconcile(settings, older_than).await,
            Commands::Migrate => migrate(&settings),
            Commands::Config => show_config(&settings),
        }
    }
}

/// Open and migrate the configured database
fn open_store(settings: &Settings) -> Result<CallStore> {
    let db_path = settings.paths.db_path();
    let store = CallStore::open(&db_path)
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?
        .with_busy_retry(settings.storage.busy_retry.clone());
    store.migrate().context("Failed to migrate database")?;
    Ok(store)
}

/// Hold an exclusive lock so two daemons never share a database
fn acquire_instance_lock(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let file = File::create(path)
        .with_context(|| format!("Failed to open lock file: {}", path.display()))?;
    file.try_lock_exclusive().with_context(|| {
        format!(
            "Another dispatch-ingest instance holds {}",
            path.display()
        )
    })?;
    Ok(file)
}

/// Run the daemon: initial scan, watcher, workers
async fn serve(settings: Settings, initial_scan: bool) -> Result<()> {
    let lock_path = settings.paths.lock_path();
    let _lock = acquire_instance_lock(&lock_path)?;

    let watcher = CallWatcher::new(WatcherConfig::new(
        &settings.paths.calls_dir,
        settings.transcription.limits.clone(),
    ));
    watcher.config().validate()?;

    let orchestrator = Orchestrator::from_settings(settings)?;
    let sweep = orchestrator.start();

    println!("👁️  Watching: {}", watcher.config().calls_dir.display());
    println!("    Database: {}", orchestrator.settings().paths.db_path().display());
    println!("    Press Ctrl+C to stop");
    println!();

    if initial_scan {
        let result = watcher.scan_once(&orchestrator).await?;
        if result.total_scanned() > 0 {
            println!(
                "📥 Initial scan: {} recording(s) seen, {} queued",
                result.total_scanned(),
                result.submitted
            );
        }
    }

    let sink: Arc<dyn CallSink> = Arc::new(orchestrator.clone());
    let handle = watcher.watch(sink, orchestrator.shutdown_token().child_token())?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    println!();
    println!("🛑 Stopping...");
    let stats = orchestrator.queue_stats();
    println!(
        "   {} processed, {} failed, {} waiting, healthy: {}",
        stats.processed,
        stats.failed,
        stats.length,
        orchestrator.healthy()
    );
    handle.stop().await?;
    let report = orchestrator.shutdown().await;
    if let Some(sweep) = sweep {
        let _ = sweep.await;
    }

    if report.abandoned > 0 {
        println!(
            "   {} queued call(s) left for the next run",
            report.abandoned
        );
    }
    if !report.drained {
        println!("   Some jobs were still running at the shutdown deadline");
    }
    Ok(())
}

/// Process one recording in-process and print the result
async fn process_one(
    settings: Settings,
    filename: &str,
    force: bool,
    notify: bool,
    options: ProcessOptions,
) -> Result<()> {
    let orchestrator = Orchestrator::from_settings(settings)?;
    orchestrator.start();

    let request = ProcessRequest::new(filename, JobSource::Api)
        .force(force)
        .notify(notify)
        .options(options);
    let admission = orchestrator.request_processing(request).await?;

    match &admission {
        Admission::Enqueued => {
            while orchestrator.is_in_flight(filename) {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
        Admission::Skipped(status) => {
            println!("ℹ️  {} is already {} (use --force to reprocess)", filename, status);
        }
        Admission::Rejected(reason) => {
            orchestrator.shutdown().await;
            anyhow::bail!("Invalid filename '{}': {}", filename, reason);
        }
        other => {
            orchestrator.shutdown().await;
            anyhow::bail!("Call was not queued: {:?}", other);
        }
    }

    // alerts are delivered in the background
    if notify && admission.is_enqueued() {
        tokio::time::sleep(orchestrator.settings().pipeline.notify_timeout()).await;
    }
    orchestrator.shutdown().await;

    match orchestrator.status(filename).await? {
        Some(record) => {
            print_record(&record);
            if !record.status.is_terminal() {
                println!("ℹ️  {} did not finish; it is still {}", filename, record.status);
            }
            if record.status == CallStatus::Error {
                std::process::exit(1);
            }
        }
        None => println!("No record for {}", filename),
    }
    Ok(())
}

/// Show the record for a call
fn show_status(settings: &Settings, filename: &str, json: bool) -> Result<()> {
    let store = open_store(settings)?;
    let record = store
        .get(filename)?
        .with_context(|| format!("No record for {}", filename))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print_record(&record);
    }
    Ok(())
}

fn print_record(record: &CallRecord) {
    println!("File:       {}", record.filename);
    println!("Status:     {}", record.status);
    if let Some(error) = &record.last_error {
        println!("Error:      {}", error);
    }
    if let Some(original) = record.duplicate_of.as_deref().filter(|d| !d.is_empty()) {
        println!("Duplicate:  {}", original);
    }
    if let Some(call_type) = &record.enrichment.call_type {
        println!("Call type:  {}", call_type);
    }
    if let Some(label) = &record.location.location_label {
        let source = record.location.location_source.as_deref().unwrap_or("unknown");
        match (record.location.latitude, record.location.longitude) {
            (Some(lat), Some(lon)) => {
                println!("Location:   {} ({:.5}, {:.5}) via {}", label, lat, lon, source)
            }
            _ => println!("Location:   {} via {}", label, source),
        }
    }
    if let Some(duration) = record.duration_seconds {
        println!("Duration:   {:.1}s", duration);
    }
    println!("Updated:    {}", record.updated_at);

    let transcript = record
        .enrichment
        .clean_transcript
        .as_deref()
        .or(record.enrichment.raw_transcript.as_deref());
    if let Some(text) = transcript {
        println!();
        println!("{}", text);
    }
    if let Some(translation) = &record.enrichment.translation {
        println!();
        println!("Translation: {}", translation);
    }
}

/// List recent calls
fn list_calls(settings: &Settings, status: Option<CallStatus>, limit: usize) -> Result<()> {
    let store = open_store(settings)?;
    let records = store.list_recent(status, limit)?;

    if records.is_empty() {
        println!("No calls found");
        return Ok(());
    }

    println!("{:<44} {:<11} {:<10} {:<30}", "FILENAME", "STATUS", "TYPE", "LOCATION");
    println!("{}", "-".repeat(98));
    for record in records {
        println!(
            "{:<44} {:<11} {:<10} {:<30}",
            record.filename,
            record.status.as_str(),
            record.enrichment.call_type.as_deref().unwrap_or("-"),
            record.location.location_label.as_deref().unwrap_or("-"),
        );
    }

    let counts = store.status_counts()?;
    println!();
    println!(
        "queued: {}  processing: {}  done: {}  error: {}",
        counts.queued, counts.processing, counts.done, counts.error
    );
    Ok(())
}

fn stale_threshold(settings: &Settings, older_than: Option<u64>) -> Duration {
    older_than
        .map(Duration::from_secs)
        .unwrap_or_else(|| settings.queue.stale_after())
}

/// Show calls stuck in queued or processing
fn show_stale(settings: &Settings, older_than: Option<u64>) -> Result<()> {
    let threshold = stale_threshold(settings, older_than);
    let store = open_store(settings)?;

    let mut any = false;
    for (label, records) in [
        ("queued", store.stale_queued(threshold)?),
        ("processing", store.stale_processing(threshold)?),
    ] {
        for record in records {
            any = true;
            println!("{:<11} {:<44} {}", label, record.filename, record.updated_at);
        }
    }
    if !any {
        println!("No calls older than {}s in queued or processing", threshold.as_secs());
    }
    Ok(())
}

/// Re-request stale queued calls and wait for the re-queued work
async fn reconcile(settings: Settings, older_than: Option<u64>) -> Result<()> {
    let threshold = stale_threshold(&settings, older_than);
    let lock_path = settings.paths.lock_path();
    let _lock = acquire_instance_lock(&lock_path)?;

    let orchestrator = Orchestrator::from_settings(settings)?;
    orchestrator.start();

    let report = orchestrator.reconcile_queued(threshold).await?;
    println!("Stale queued:      {}", report.found);
    println!("  Re-queued:       {}", report.requeued);
    println!("  Skipped:         {}", report.skipped);
    if report.dropped > 0 {
        println!("  Dropped:         {}", report.dropped);
    }
    println!("Stuck processing:  {}", report.stale_processing);

    while orchestrator.in_flight_count() > 0 {
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    orchestrator.shutdown().await;
    Ok(())
}

/// Apply pending database migrations
fn migrate(settings: &Settings) -> Result<()> {
    let db_path = settings.paths.db_path();
    let store = CallStore::open(&db_path)
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
    let applied = store.migrate()?;

    println!("Database:       {}", db_path.display());
    println!("Applied now:    {}", applied);
    println!("Schema version: {}", store.schema_version()?);
    Ok(())
}

/// Show resolved configuration (debug)
fn show_config(settings: &Settings) -> Result<()> {
    println!(
        "# Config file: {}",
        settings
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!("# Database:    {}", settings.paths.db_path().display());
    println!(
        "# API key:     {}",
        if settings.openai.api_key.is_some() { "set" } else { "missing" }
    );
    print!("{}", serde_yaml::to_string(settings)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_process_options() {
        let cli = Cli::try_parse_from([
            "dispatch-ingest",
            "process",
            "Newton_Fire_2025_01_02_03_04_05.mp3",
            "--mode",
            "translate",
            "--format",
            "diarized_json",
            "--force",
        ])
        .unwrap();
        match cli.command {
            Commands::Process {
                filename,
                force,
                mode,
                format,
                ..
            } => {
                assert_eq!(filename, "Newton_Fire_2025_01_02_03_04_05.mp3");
                assert!(force);
                assert_eq!(mode, TranscriptionMode::Translate);
                assert_eq!(format, TranscriptFormat::DiarizedJson);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_status_filter() {
        let cli = Cli::try_parse_from(["dispatch-ingest", "list", "--status", "error"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::List {
                status: Some(CallStatus::Error),
                limit: 20
            }
        ));
        assert!(Cli::try_parse_from(["dispatch-ingest", "list", "--status", "finished"]).is_err());
    }

    #[test]
    fn test_instance_lock_is_exclusive() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("work").join("transcriptions.db.lock");

        let first = acquire_instance_lock(&path).unwrap();
        assert!(acquire_instance_lock(&path).is_err());
        drop(first);
        assert!(acquire_instance_lock(&path).is_ok());
    }
}
