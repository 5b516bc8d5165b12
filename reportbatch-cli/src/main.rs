//! reportbatch CLI: resilient report batches against the reporting API.
//!
//! Commands:
//! - `run` fetch one report for every portfolio in a catalog
//! - `retry` re-run only the failures that are past their backoff
//! - `stats` summarize the failure store
//! - `purge` drop old or abandoned failure records
//! - `export-failures` write the failure store as CSV
//! - `consolidate` merge the artifacts listed in a run manifest
//!
//! The API endpoint is configured through `REPORT_API_URL`, `REPORT_API_KEY`
//! and `REPORT_API_TIMEOUT_SECS`. Log verbosity follows `RUST_LOG`.

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use reportbatch_core::writer::write_atomic;
use reportbatch_core::{
    export_csv, select_portfolios, Clock, Endpoint, FailureStore, FsOutputWriter,
    HttpClientConfig, HttpReportClient, PortfolioCatalog, RateLimiter, ReportFormat,
    ReportRequest, SystemClock, TomlCatalog,
};
use reportbatch_runner::{
    consolidate, consolidate_each_format, ConsolidationSummary, EngineConfig, LogProgress,
    Orchestrator, OrchestratorParts, RunMode, RunStatistics,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "reportbatch",
    about = "Resilient portfolio report batches with durable retry state"
)]
struct Cli {
    /// Engine configuration TOML. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch one report for every portfolio in the catalog.
    Run {
        /// Portfolio catalog TOML.
        #[arg(long)]
        catalog: PathBuf,

        /// Report endpoint id (e.g., 1048).
        #[arg(long)]
        endpoint: String,

        /// Output format: PDF, CSVBR, CSVUS, TXTBR, TXTUS or JSON.
        #[arg(long, default_value = "CSVBR")]
        format: String,

        /// Reference date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        date: Option<String>,

        /// Extra request parameter as key=value. Repeatable.
        #[arg(long = "param")]
        params: Vec<String>,

        /// Only these portfolio ids (comma-separated). Defaults to the whole catalog.
        #[arg(long, value_delimiter = ',')]
        portfolios: Vec<String>,

        /// Consolidate successful artifacts into this file.
        #[arg(long)]
        consolidate: Option<PathBuf>,
    },
    /// Retry failures whose backoff has elapsed.
    Retry {
        /// Portfolio catalog TOML; orders the retries.
        #[arg(long)]
        catalog: PathBuf,

        /// Format for records that did not store one.
        #[arg(long, default_value = "CSVBR")]
        format: String,

        /// Reference date for records that did not store one. Defaults to today.
        #[arg(long)]
        date: Option<String>,

        /// Retry at most this many failures; the rest wait for a later run.
        #[arg(long)]
        max_portfolios: Option<usize>,

        /// Consolidate successful artifacts into this file.
        #[arg(long)]
        consolidate: Option<PathBuf>,
    },
    /// Summarize the failure store.
    Stats {
        /// Print as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Remove failure records.
    Purge {
        /// Remove records whose last attempt is older than this many hours.
        #[arg(long)]
        older_than_hours: Option<u64>,

        /// Remove abandoned records.
        #[arg(long, default_value_t = false)]
        abandoned: bool,
    },
    /// Write every failure record to a CSV file.
    ExportFailures {
        #[arg(long)]
        out: PathBuf,
    },
    /// Merge the artifacts listed in a run manifest.
    Consolidate {
        /// Run manifest JSON written by `run` or `retry`.
        #[arg(long)]
        manifest: PathBuf,

        /// Output file.
        #[arg(long)]
        out: PathBuf,

        /// Format to consolidate. Defaults to one output per format found.
        #[arg(long)]
        format: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading engine config");
            EngineConfig::from_file(path)?
        }
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Run {
            catalog,
            endpoint,
            format,
            date,
            params,
            portfolios,
            consolidate,
        } => {
            let mut request =
                ReportRequest::new(Endpoint::new(endpoint), parse_format(&format)?, parse_date(date)?);
            for param in &params {
                let (key, value) = parse_param(param)?;
                request = request.with_param(key, value);
            }
            let batch = Batch {
                mode: RunMode::FullBatch,
                only: portfolios,
                max: None,
            };
            run_batch(config, &catalog, &request, batch, consolidate)
        }
        Commands::Retry {
            catalog,
            format,
            date,
            max_portfolios,
            consolidate,
        } => {
            // The endpoint of every retry comes from its stored record.
            let fallback =
                ReportRequest::new(Endpoint::new(""), parse_format(&format)?, parse_date(date)?);
            let batch = Batch {
                mode: RunMode::RetryFailuresOnly,
                only: Vec::new(),
                max: max_portfolios,
            };
            run_batch(config, &catalog, &fallback, batch, consolidate)
        }
        Commands::Stats { json } => run_stats(&config, json),
        Commands::Purge {
            older_than_hours,
            abandoned,
        } => run_purge(&config, older_than_hours, abandoned),
        Commands::ExportFailures { out } => run_export(&config, &out),
        Commands::Consolidate {
            manifest,
            out,
            format,
        } => run_consolidate(&manifest, &out, format.as_deref()),
    }
}

fn parse_format(s: &str) -> Result<ReportFormat> {
    match ReportFormat::parse(s) {
        Some(format) => Ok(format),
        None => bail!("unknown format '{s}'. Valid: PDF, CSVBR, CSVUS, TXTBR, TXTUS, JSON"),
    }
}

fn parse_date(date: Option<String>) -> Result<NaiveDate> {
    Ok(date
        .as_deref()
        .map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .transpose()
        .context("dates must be YYYY-MM-DD")?
        .unwrap_or_else(|| chrono::Local::now().date_naive()))
}

/// `key=value`; the value is taken as JSON when it parses, else as a string.
fn parse_param(param: &str) -> Result<(String, serde_json::Value)> {
    let Some((key, value)) = param.split_once('=') else {
        bail!("--param expects key=value, got '{param}'");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("--param key must not be empty");
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn http_config() -> Result<HttpClientConfig> {
    let base_url = std::env::var("REPORT_API_URL").context("REPORT_API_URL is not set")?;
    let api_key = std::env::var("REPORT_API_KEY").context("REPORT_API_KEY is not set")?;
    let mut config = HttpClientConfig::new(base_url, api_key);
    if let Ok(secs) = std::env::var("REPORT_API_TIMEOUT_SECS") {
        let secs: u64 = secs
            .parse()
            .with_context(|| format!("REPORT_API_TIMEOUT_SECS must be a number, got '{secs}'"))?;
        config.timeout = Duration::from_secs(secs);
    }
    Ok(config)
}

fn open_store(config: &EngineConfig) -> Result<FailureStore> {
    Ok(FailureStore::open_json(
        &config.store.path,
        config.retry_policy(),
        Arc::new(SystemClock),
    )?)
}

fn build_orchestrator(config: EngineConfig) -> Result<Orchestrator> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(FailureStore::open_json(
        &config.store.path,
        config.retry_policy(),
        clock.clone(),
    )?);
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit.max_calls,
        config.rate_period(),
        clock.clone(),
    ));
    let client = Arc::new(HttpReportClient::new(http_config()?)?);

    Ok(Orchestrator::new(OrchestratorParts {
        client,
        writer: Arc::new(FsOutputWriter::new()),
        store,
        limiter,
        clock,
        config,
    })
    .with_progress(Arc::new(LogProgress)))
}

/// Which portfolios a `run` or `retry` works on.
struct Batch {
    mode: RunMode,
    /// Catalog subset; empty means all.
    only: Vec<String>,
    /// Cap on retried failures.
    max: Option<usize>,
}

fn run_batch(
    config: EngineConfig,
    catalog: &Path,
    request: &ReportRequest,
    batch: Batch,
    consolidate_to: Option<PathBuf>,
) -> Result<()> {
    let catalog = TomlCatalog::from_file(catalog)?.list_portfolios()?;
    let portfolios = select_portfolios(&catalog, &batch.only)?;
    let output_dir = config.output.dir.clone();
    let orchestrator = build_orchestrator(config)?;

    let stats = match batch.max {
        Some(max) => orchestrator.retry_at_most(&portfolios, request, max)?,
        None => orchestrator.run(&portfolios, request, batch.mode)?,
    };
    print_summary(&stats);

    let manifest = write_manifest(&output_dir, &stats)?;
    println!("Run manifest: {}", manifest.display());

    if let Some(path) = consolidate_to {
        if stats.successes.is_empty() {
            println!("Nothing to consolidate.");
        } else {
            // Retries replay each record's own format, so one run can mix formats.
            for summary in consolidate_each_format(&stats.successes, &path, Utc::now())? {
                print_consolidation(&summary);
            }
        }
    }

    if !stats.all_succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

fn write_manifest(output_dir: &Path, stats: &RunStatistics) -> Result<PathBuf> {
    let path = output_dir.join(format!(
        "run_{}_{}.json",
        stats.mode,
        stats.finished_at.format("%Y%m%d_%H%M%S")
    ));
    let json = serde_json::to_vec_pretty(stats)?;
    write_atomic(&json, &path).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

fn run_stats(config: &EngineConfig, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let stats = store.stats(Utc::now());

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Failure store:   {}", config.store.path.display());
    println!("Total records:   {}", stats.total);
    println!("Recoverable:     {}", stats.recoverable);
    println!("Abandoned:       {}", stats.abandoned);
    println!("Eligible now:    {}", stats.eligible_now);
    if let Some(age) = stats.oldest_failure_age {
        println!("Oldest failure:  {:.1} h", age.as_secs_f64() / 3600.0);
    }
    if !stats.failures_by_kind.is_empty() {
        println!();
        println!("{:<20} {:>6}", "Kind", "Count");
        println!("{}", "-".repeat(27));
        for (kind, count) in &stats.failures_by_kind {
            println!("{:<20} {:>6}", kind, count);
        }
    }
    Ok(())
}

fn run_purge(config: &EngineConfig, older_than_hours: Option<u64>, abandoned: bool) -> Result<()> {
    if older_than_hours.is_none() && !abandoned {
        bail!("one of --older-than-hours or --abandoned is required");
    }
    let store = open_store(config)?;
    if let Some(hours) = older_than_hours {
        let removed = store.purge_older_than(hours)?;
        println!("Removed {removed} record(s) older than {hours} h.");
    }
    if abandoned {
        let removed = store.purge_abandoned()?;
        println!("Removed {removed} abandoned record(s).");
    }
    println!("{} record(s) remain.", store.len());
    Ok(())
}

fn run_export(config: &EngineConfig, out: &Path) -> Result<()> {
    let store = open_store(config)?;
    let rows = export_csv(&store.records(), store.policy(), Utc::now(), out)?;
    println!("Exported {rows} failure record(s) to {}", out.display());
    Ok(())
}

fn run_consolidate(manifest: &Path, out: &Path, format: Option<&str>) -> Result<()> {
    let content = std::fs::read(manifest)
        .with_context(|| format!("failed to read {}", manifest.display()))?;
    let stats: RunStatistics = serde_json::from_slice(&content)
        .with_context(|| format!("{} is not a run manifest", manifest.display()))?;

    if stats.successes.is_empty() {
        bail!("manifest lists no successful artifacts");
    }
    match format {
        Some(s) => {
            let summary = consolidate(&stats.successes, out, parse_format(s)?, Utc::now())?;
            print_consolidation(&summary);
        }
        None => {
            for summary in consolidate_each_format(&stats.successes, out, Utc::now())? {
                print_consolidation(&summary);
            }
        }
    }
    Ok(())
}

fn print_summary(stats: &RunStatistics) {
    println!();
    println!("=== {} ===", stats.mode);
    println!("Succeeded:        {}", stats.succeeded);
    println!("Failed:           {}", stats.failed);
    println!("Circuit tripped:  {}", stats.circuit_tripped);
    println!("Abandoned:        {}", stats.abandoned);
    if stats.not_started > 0 {
        println!("Not started:      {}", stats.not_started);
    }
    println!("Success rate:     {:.1}%", stats.success_rate() * 100.0);
    for (kind, count) in &stats.failures_by_kind {
        println!("  {kind:<18} {count}");
    }
    let secs = (stats.finished_at - stats.started_at).num_milliseconds() as f64 / 1000.0;
    println!("Elapsed:          {secs:.1}s");
    if stats.storage_degraded {
        println!();
        println!("WARNING: the failure store could not be written. Failures from this run");
        println!("         were kept in memory only and will not be retried next time.");
    }
}

fn print_consolidation(summary: &ConsolidationSummary) {
    println!(
        "Consolidated {} artifact(s), {} row(s) into {} ({} duplicate(s) dropped)",
        summary.artifacts,
        summary.rows,
        summary.output_path.display(),
        summary.duplicates_dropped
    );
    if summary.normalized_cells > 0 {
        println!("  normalized {} cell(s)", summary.normalized_cells);
    }
    if summary.schema_warnings > 0 {
        println!(
            "  {} artifact(s) missing required columns for their endpoint",
            summary.schema_warnings
        );
    }
}
