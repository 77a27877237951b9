//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use lakehouse_core::pipeline::{
    Coordinator, ProgressReporter, RunReport, RunStatus, StepReport, StepState, StepStatus,
};
use lakehouse_core::sync::{CURATED_INDEX_WATERMARK, Synchronizer};
use lakehouse_index::{HttpIndexOptions, HttpVectorIndex};
use lakehouse_shared::{
    AppConfig, PipelineConfig, Stage, TransitionOutcome, init_config, load_config,
    load_config_from,
};
use lakehouse_storage::{LineageFilter, Storage};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Lakehouse: staged, deduplicated, auditable document pipeline.
#[derive(Parser)]
#[command(
    name = "lakehouse",
    version,
    about = "Promote scraped documents through RAW, CLEANED and CURATED stages and sync them to a vector index.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.lakehouse/lakehouse.toml).
    #[arg(long, global = true, env = "LAKEHOUSE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database path, overriding `[storage] database_path`.
    #[arg(long, global = true, env = "LAKEHOUSE_DB")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Land a directory of scraped `*.json` documents as the next RAW batch.
    Ingest {
        /// Directory holding `{url, title, content}` JSON files.
        dir: PathBuf,
    },

    /// Promote RAW batches through CLEANED into CURATED.
    ///
    /// Without `--batch`, runs every RAW batch not yet curated.
    Run {
        /// Run a single RAW batch.
        #[arg(long)]
        batch: Option<u64>,

        /// Also rerun batches that were rejected and have not changed since.
        #[arg(long, conflicts_with = "batch")]
        retry_rejected: bool,

        /// Override `[pipeline] min_content_length`.
        #[arg(long)]
        min_content_length: Option<usize>,

        /// Print run reports as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Push curated changes into the vector index.
    Sync {
        /// Compute the delta without touching the index.
        #[arg(long)]
        dry_run: bool,
    },

    /// Query the lineage log.
    Lineage {
        /// Target stage (raw, cleaned, curated).
        #[arg(long)]
        stage: Option<String>,

        /// Only committed or rejected transitions.
        #[arg(long)]
        outcome: Option<String>,

        /// Only this batch id.
        #[arg(long)]
        batch: Option<u64>,

        /// RFC 3339 lower bound on the recorded time.
        #[arg(long)]
        since: Option<String>,

        /// RFC 3339 upper bound on the recorded time.
        #[arg(long)]
        until: Option<String>,

        /// Maximum entries to print.
        #[arg(long)]
        limit: Option<usize>,

        /// Print entries as JSON lines.
        #[arg(long)]
        json: bool,
    },

    /// Record counts and content statistics per stage.
    Stats {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Remove a record from the curated layer; the next sync deletes it from the index.
    Retract {
        /// Record id.
        id: String,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "lakehouse=info",
        1 => "lakehouse=debug",
        _ => "lakehouse=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    if let Command::Config { action } = &cli.command {
        return match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(cli.config.as_deref()),
        };
    }

    let config = resolve_config(cli.config.as_deref())?;
    let db_path = cli
        .db
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.storage.database_path));

    match cli.command {
        Command::Ingest { dir } => cmd_ingest(&config, &db_path, &dir).await,
        Command::Run {
            batch,
            retry_rejected,
            min_content_length,
            json,
        } => {
            let selection = RunSelection::new(batch, retry_rejected);
            cmd_run(&config, &db_path, selection, min_content_length, json).await
        }
        Command::Sync { dry_run } => cmd_sync(&config, &db_path, dry_run).await,
        Command::Lineage {
            stage,
            outcome,
            batch,
            since,
            until,
            limit,
            json,
        } => {
            let filter = LineageFilter {
                stage_to: stage.as_deref().map(str::parse::<Stage>).transpose()?,
                outcome: outcome
                    .as_deref()
                    .map(str::parse::<TransitionOutcome>)
                    .transpose()?,
                min_batch_id: batch,
                max_batch_id: batch,
                since: since.as_deref().map(parse_time).transpose()?,
                until: until.as_deref().map(parse_time).transpose()?,
                limit,
            };
            cmd_lineage(&config, &db_path, filter, json).await
        }
        Command::Stats { json } => cmd_stats(&config, &db_path, json).await,
        Command::Retract { id } => cmd_retract(&config, &db_path, &id).await,
        Command::Config { .. } => Ok(()),
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    };
    Ok(config)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| eyre!("invalid timestamp '{raw}': {e}"))
}

async fn open_storage(config: &AppConfig, db_path: &Path) -> Result<Storage> {
    let storage = Storage::open(db_path)
        .await
        .wrap_err_with(|| format!("opening {}", db_path.display()))?
        .with_stage_names(config.pipeline.stage_names.clone())?;
    Ok(storage)
}

async fn open_storage_readonly(config: &AppConfig, db_path: &Path) -> Result<Storage> {
    if !db_path.exists() {
        return Err(eyre!(
            "no database at '{}'; run `lakehouse ingest` first",
            db_path.display()
        ));
    }
    let storage = Storage::open_readonly(db_path)
        .await?
        .with_stage_names(config.pipeline.stage_names.clone())?;
    Ok(storage)
}

// ---------------------------------------------------------------------------
// ingest / run
// ---------------------------------------------------------------------------

async fn cmd_ingest(config: &AppConfig, db_path: &Path, dir: &Path) -> Result<()> {
    let storage = open_storage(config, db_path).await?;
    let report = lakehouse_core::ingest::ingest_dir(&storage, dir, &config.fingerprint).await?;

    for path in &report.skipped {
        warn!(path = %path.display(), "skipped");
    }
    println!(
        "Landed RAW batch {} ({} records, {} skipped)",
        report.batch_id,
        report.records,
        report.skipped.len()
    );
    Ok(())
}

/// Which RAW batches a `run` covers.
#[derive(Debug, PartialEq)]
enum RunSelection {
    Batch(u64),
    Pending { retry_rejected: bool },
}

impl RunSelection {
    fn new(batch: Option<u64>, retry_rejected: bool) -> Self {
        match batch {
            Some(id) => Self::Batch(id),
            None => Self::Pending { retry_rejected },
        }
    }
}

async fn cmd_run(
    config: &AppConfig,
    db_path: &Path,
    selection: RunSelection,
    min_content_length: Option<usize>,
    json: bool,
) -> Result<()> {
    let storage = open_storage(config, db_path).await?;

    let mut pipeline = PipelineConfig::from(config);
    if let Some(min) = min_content_length {
        pipeline.min_content_length = min;
    }

    // Ctrl-C stops the run at the next state boundary, before any commit.
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let reporter = CliProgress::new();
    let coordinator = Coordinator::new(&storage, pipeline, &reporter)?.with_cancellation(cancel);

    let result = match selection {
        RunSelection::Batch(id) => coordinator.run_batch(id).await.map(|r| vec![r]),
        RunSelection::Pending { retry_rejected } => coordinator.run_pending(retry_rejected).await,
    };
    reporter.spinner.finish_and_clear();

    let reports = match result {
        Ok(reports) => reports,
        Err(e) => {
            println!("status: {}", RunStatus::for_error(&e).as_str());
            return Err(e.into());
        }
    };

    if reports.is_empty() {
        println!("Nothing to run: every RAW batch is curated or waiting on corrected input.");
        return Ok(());
    }

    for report in &reports {
        if json {
            println!("{}", serde_json::to_string(report)?);
        } else {
            print_run_report(report);
        }
    }

    // Surface the first rejection as a non-zero exit for the scheduler.
    for report in &reports {
        report.ensure_committed()?;
    }
    Ok(())
}

fn print_run_report(report: &RunReport) {
    println!("{}", report.summary_line());
    for step in &report.steps {
        let status = match step.status {
            StepStatus::Committed => "committed",
            StepStatus::Replayed => "replayed",
            StepStatus::Rejected => "rejected",
        };
        let detail = step
            .verdict
            .as_ref()
            .and_then(|v| v.failure)
            .map(|f| format!(" ({f})"))
            .unwrap_or_default();
        println!("  {} -> {}: {status}{detail}", step.stage_from, step.stage_to);
    }
    println!("status: {}", report.status.as_str());
}

// ---------------------------------------------------------------------------
// sync / retract
// ---------------------------------------------------------------------------

async fn cmd_sync(config: &AppConfig, db_path: &Path, dry_run: bool) -> Result<()> {
    let storage = open_storage(config, db_path).await?;
    let io_timeout = Duration::from_millis(config.pipeline.io_timeout_ms);

    let endpoint = config
        .index
        .endpoint_url()?
        .ok_or_else(|| eyre!("no [index] endpoint configured; set it in the config file"))?;
    let index = HttpVectorIndex::new(
        endpoint,
        HttpIndexOptions {
            timeout: Duration::from_millis(config.index.timeout_ms),
            api_key: config.index.api_key(),
        },
    )?;
    let sync = Synchronizer::new(&storage, &index, io_timeout);

    if dry_run {
        let since = storage.sync_watermark(CURATED_INDEX_WATERMARK).await?;
        let delta = sync.compute_delta(since).await?;
        println!(
            "Would upsert {} and delete {} documents",
            delta.upserts.len(),
            delta.deletes.len()
        );
        return Ok(());
    }

    info!("syncing curated layer to vector index");
    let report = sync.sync().await?;
    println!(
        "Index synced: {} upserted, {} deleted",
        report.upserted, report.deleted
    );
    Ok(())
}

async fn cmd_retract(config: &AppConfig, db_path: &Path, id: &str) -> Result<()> {
    let storage = open_storage(config, db_path).await?;
    if storage.delete_record(Stage::Curated, id).await? {
        info!(id, "record retracted from curated layer");
        println!("Retracted {id}; run `lakehouse sync` to remove it from the index.");
        Ok(())
    } else {
        Err(eyre!("no curated record with id '{id}'"))
    }
}

// ---------------------------------------------------------------------------
// lineage / stats
// ---------------------------------------------------------------------------

async fn cmd_lineage(
    config: &AppConfig,
    db_path: &Path,
    filter: LineageFilter,
    json: bool,
) -> Result<()> {
    let storage = open_storage_readonly(config, db_path).await?;
    let mut cursor = storage.query_lineage(filter);

    while let Some(entry) = cursor.next().await? {
        if json {
            println!("{}", serde_json::to_string(&entry)?);
        } else {
            println!(
                "#{:<5} {}  {}",
                entry.sequence,
                entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                entry.summary()
            );
        }
    }
    Ok(())
}

async fn cmd_stats(config: &AppConfig, db_path: &Path, json: bool) -> Result<()> {
    let storage = open_storage_readonly(config, db_path).await?;

    let mut stages = Vec::new();
    for stage in Stage::ALL {
        stages.push(storage.stage_stats(stage).await?);
    }
    let totals = storage.lineage_totals().await?;

    if json {
        let out = serde_json::json!({ "stages": stages, "lineage": totals });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  {:<8} {:>8} {:>8} {:>10} {:>6} {:>6}", "stage", "batches", "records", "avg len", "min", "max");
    for s in &stages {
        println!(
            "  {:<8} {:>8} {:>8} {:>10.1} {:>6} {:>6}",
            s.stage.as_str(),
            s.batch_count,
            s.record_count,
            s.avg_content_length,
            s.min_content_length,
            s.max_content_length
        );
    }
    println!();
    for t in &totals {
        let stage = t.stage_to.map_or("?", |s| s.as_str());
        println!(
            "  -> {stage:<8} committed={} rejected={} rejected_records={} collapsed_records={}",
            t.committed_batches, t.rejected_batches, t.rejected_records, t.collapsed_records
        );
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn step_state(&self, batch_id: u64, stage_to: Stage, state: StepState) {
        let state = match state {
            StepState::Fetched => "fetched",
            StepState::Transformed => "transformed",
            StepState::Gated => "gated",
            StepState::Committed => "committed",
            StepState::Rejected => "rejected",
        };
        self.spinner
            .set_message(format!("batch {batch_id} -> {stage_to}: {state}"));
    }

    fn step_done(&self, report: &StepReport) {
        if report.status == StepStatus::Rejected {
            self.spinner.println(format!(
                "batch {} rejected at {}",
                report.batch_id, report.stage_to
            ));
        }
    }

    fn done(&self, report: &RunReport) {
        self.spinner
            .set_message(format!("batch {} {}", report.batch_id, report.status.as_str()));
    }
}
