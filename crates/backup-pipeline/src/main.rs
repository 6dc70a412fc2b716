use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use backup_pipeline::config::{self, BackupConfig};
use backup_pipeline::jobs::scheduler::{DriveOutcome, LocalScheduler, format_queue_report};
use backup_pipeline::jobs::{JobSpec, Scheduler, backup_chain};
use backup_pipeline::local::{ArtifactValidator, DirExporter, LocalAttachments};
use backup_pipeline::media::JsonMediaSnapshots;
use backup_pipeline::pipeline::{BackupContext, MessageBackupJob};
use backup_pipeline::progress::LogSink;
use backup_pipeline::remote::HttpRemote;
use backup_pipeline::store::{JsonStore, format_status_report};
use backup_pipeline::{Error, Result};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Log output format
    #[arg(long, value_enum, global = true, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Queue a backup chain and drive the message backup to completion
    Run {
        /// Path to a backup config TOML
        #[arg(long)]
        config: PathBuf,
        /// Prune stale media after the backup succeeds
        #[arg(long)]
        prune_stale_media: bool,
    },
    /// Print bookkeeping and queued jobs
    Status {
        /// Path to a backup config TOML
        #[arg(long)]
        config: PathBuf,
    },
    /// Load config and print the fully-resolved TOML (after extends)
    Resolve {
        /// Path to a backup config TOML
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    let args = Args::parse();
    init_tracing(args.log_format);
    match args.cmd {
        Command::Run {
            config,
            prune_stale_media,
        } => cmd_run(&config, prune_stale_media),
        Command::Status { config } => cmd_status(&config),
        Command::Resolve { config } => cmd_resolve(&config),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (text, json) = match format {
        LogFormat::Text => (Some(tracing_subscriber::fmt::layer().with_target(false)), None),
        LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .init();
}

fn load_config(path: &Path) -> Result<BackupConfig> {
    let doc = config::load(path)?;
    BackupConfig::from_doc(&doc)
}

fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .map_err(|e| Error::io(format!("failed to create {}: {e}", dir.display())))
}

fn cmd_resolve(path: &Path) -> Result<()> {
    let doc = config::load(path)?;
    // Best-effort pretty print of resolved config.
    let s = toml::to_string_pretty(&doc.value).unwrap_or_else(|_| format!("{:?}", doc.value));
    print!("{s}");
    Ok(())
}

fn cmd_status(path: &Path) -> Result<()> {
    let cfg = load_config(path)?;
    let state_dir = cfg.state_dir();
    let store = JsonStore::open(&state_dir.join("state.json"), cfg.settings())?;
    let scheduler = LocalScheduler::open(&state_dir.join("jobs.json"))?;
    print!("{}", format_status_report(&store.snapshot(), &cfg.settings()));
    print!("{}", format_queue_report(&scheduler.entries()));
    Ok(())
}

fn cmd_run(path: &Path, prune_stale_media: bool) -> Result<()> {
    let cfg = load_config(path)?;
    let settings = cfg.settings();
    let key = cfg.backup_key()?;
    let state_dir = cfg.state_dir();
    ensure_dir(&state_dir)?;

    let store = Arc::new(JsonStore::open(&state_dir.join("state.json"), settings)?);
    let media = Arc::new(JsonMediaSnapshots::open(&state_dir.join("media_snapshot.json"))?);
    let scheduler = Arc::new(LocalScheduler::open(&state_dir.join("jobs.json"))?);
    let attachments = Arc::new(LocalAttachments::new(&cfg.data_dir()));

    let mut chain = backup_chain(&settings, prune_stale_media);
    if let Some(head) = chain.first_mut() {
        head.options.max_attempts = cfg.backup.max_attempts;
    }
    scheduler.enqueue_chain(chain)?;

    let Some(entry) = scheduler.next_runnable(MessageBackupJob::KIND) else {
        println!("no runnable backup job; it is waiting on an earlier job");
        print!("{}", format_queue_report(&scheduler.entries()));
        return Ok(());
    };

    let ctx = BackupContext {
        store: store.clone(),
        media,
        attachments: attachments.clone(),
        exporter: Arc::new(DirExporter::new(&cfg.data_dir(), attachments)),
        validator: Arc::new(ArtifactValidator {
            allow_plaintext: cfg.backup.plaintext,
        }),
        remote: Arc::new(HttpRemote::from_config(&cfg.remote)?),
        progress: Arc::new(LogSink),
        scheduler: scheduler.clone(),
        key,
        artifact_dir: Some(cfg.artifact_dir()),
        default_backoff: cfg.default_backoff(),
        plaintext: cfg.backup.plaintext,
    };
    let job = MessageBackupJob::new(Arc::new(ctx));
    let report = scheduler.drive(entry.id, &job)?;

    let verdict = match report.outcome {
        DriveOutcome::Succeeded => "succeeded",
        DriveOutcome::Failed => "failed",
        DriveOutcome::RetriesExhausted => "gave up after retries",
    };
    println!("backup {verdict} after {} attempt(s)", report.attempts);
    print!("{}", format_status_report(&store.snapshot(), &settings));
    print!("{}", format_queue_report(&scheduler.entries()));
    Ok(())
}
