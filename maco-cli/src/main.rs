//! MACO CLI: ingest, compute, and report commands.
//!
//! Commands:
//! - `backfill`: fetch trailing history from the bulk provider and recompute
//! - `snapshot`: ingest one day from the snapshot provider, with fallback
//! - `compute`: bring features, signals, and predictions up to date
//! - `daily`: snapshot for the previous UTC day, then incremental compute
//! - `report joined` / `report latest`: the two read contracts
//! - `audit`: rejected and drift-flagged records for a symbol

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use maco_core::archive::RawArchive;
use maco_core::config::PipelineConfig;
use maco_core::data::{FinnhubProvider, PriceProvider, SyntheticProvider, YahooProvider};
use maco_core::domain::DateRange;
use maco_core::store::{CanonicalStore, SqliteStore};
use maco_runner::{write_joined_csv, ComputeMode, JobRunner, JobSummary, Pipeline};

#[derive(Parser)]
#[command(
    name = "maco",
    about = "MACO: moving-average crossover pipeline for daily bars"
)]
struct Cli {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    /// Stop starting new symbols after this many seconds.
    #[arg(long, global = true)]
    max_runtime_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch trailing history from Yahoo (or the synthetic walk) and recompute.
    Backfill {
        /// Symbols to process (comma-separated). Defaults to the configured list.
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,

        /// Trailing calendar days ending today. Defaults to `backfill_days`.
        #[arg(long)]
        days: Option<u32>,

        /// Use the offline synthetic provider instead of Yahoo.
        #[arg(long, default_value_t = false)]
        synthetic: bool,
    },
    /// Ingest one day from Finnhub, falling back to Yahoo.
    Snapshot {
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,

        /// Trade date (YYYY-MM-DD). Defaults to the previous UTC day.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Recompute features, signals, and predictions from stored bars.
    Compute {
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,

        /// Recompute the whole history instead of extending it.
        #[arg(long, default_value_t = false)]
        full: bool,
    },
    /// Scheduled job: snapshot for the previous UTC day, then compute.
    Daily,
    /// Read the published tables.
    Report {
        #[command(subcommand)]
        view: ReportView,
    },
    /// Show rejected bars and drift flags for a symbol.
    Audit {
        #[arg(long)]
        symbol: String,
    },
}

#[derive(Subcommand)]
enum ReportView {
    /// Bars joined with features, signals, and the current prediction.
    Joined {
        #[arg(long)]
        symbol: String,

        #[arg(long)]
        start: Option<NaiveDate>,

        #[arg(long)]
        end: Option<NaiveDate>,

        /// Write CSV to this path instead of printing JSON.
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Latest prediction per symbol within the lookback window.
    Latest {
        /// Defaults to today (UTC).
        #[arg(long)]
        as_of: Option<NaiveDate>,

        /// Defaults to `prediction_lookback_days`.
        #[arg(long)]
        lookback_days: Option<u32>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    // Load .env first so RUST_LOG from it reaches the filter.
    let dotenv = dotenvy::dotenv();
    init_logging(cli.json);
    if let Err(e) = dotenv {
        if !e.not_found() {
            warn!(error = %e, "failed to load .env");
        }
    }
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Backfill {
            symbols,
            days,
            synthetic,
        } => {
            let runner = build_runner(&config, cli.max_runtime_secs)?;
            let symbols = pick_symbols(symbols, &config);
            let days = days.unwrap_or(config.backfill_days);
            let range = DateRange::trailing_days(Utc::now().date_naive(), days);
            let summary = if synthetic {
                runner.run_backfill(&SyntheticProvider::new(), &symbols, range)?
            } else {
                let yahoo = YahooProvider::new(&config.provider)?;
                runner.run_backfill(&yahoo, &symbols, range)?
            };
            finish(&summary)
        }
        Commands::Snapshot { symbols, date } => {
            let runner = build_runner(&config, cli.max_runtime_secs)?;
            let symbols = pick_symbols(symbols, &config);
            let day = date.unwrap_or_else(previous_utc_day);
            let yahoo = YahooProvider::new(&config.provider)?;
            let finnhub = finnhub_provider(&config)?;
            let snapshot = finnhub.as_ref().map(|p| p as &dyn PriceProvider);
            finish(&runner.run_snapshot(snapshot, &yahoo, &symbols, day)?)
        }
        Commands::Compute { symbols, full } => {
            let runner = build_runner(&config, cli.max_runtime_secs)?;
            let symbols = pick_symbols(symbols, &config);
            let mode = if full {
                ComputeMode::Full
            } else {
                ComputeMode::Incremental
            };
            finish(&runner.run_compute(&symbols, mode)?)
        }
        Commands::Daily => {
            let runner = build_runner(&config, cli.max_runtime_secs)?;
            let yahoo = YahooProvider::new(&config.provider)?;
            let finnhub = finnhub_provider(&config)?;
            let snapshot = finnhub.as_ref().map(|p| p as &dyn PriceProvider);
            let day = previous_utc_day();
            finish(&runner.run_daily(snapshot, &yahoo, &config.symbols, day)?)
        }
        Commands::Report { view } => {
            let store = open_store(&config)?;
            match view {
                ReportView::Joined {
                    symbol,
                    start,
                    end,
                    csv,
                } => run_report_joined(&store, &symbol, start, end, csv.as_deref()),
                ReportView::Latest {
                    as_of,
                    lookback_days,
                } => {
                    let as_of = as_of.unwrap_or_else(|| Utc::now().date_naive());
                    let lookback = lookback_days.unwrap_or(config.prediction_lookback_days);
                    let rows = store.latest_predictions(as_of, lookback)?;
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                    Ok(())
                }
            }
        }
        Commands::Audit { symbol } => {
            let store = open_store(&config)?;
            let report = serde_json::json!({
                "symbol": &symbol,
                "rejected": store.rejections(&symbol)?,
                "drift": store.drift_flags(&symbol)?,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("maco=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let base = match path {
        Some(p) => PipelineConfig::from_file(p)
            .with_context(|| format!("failed to load config {}", p.display()))?,
        None => PipelineConfig::default(),
    };
    let config = base.with_env_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

fn open_store(config: &PipelineConfig) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::open(&config.store_path)
        .with_context(|| format!("failed to open store {}", config.store_path.display()))?;
    Ok(Arc::new(store))
}

fn build_runner(config: &PipelineConfig, max_runtime_secs: Option<u64>) -> Result<JobRunner> {
    let pipeline = Pipeline::new(
        open_store(config)?,
        config.archive_dir.as_ref().map(RawArchive::new),
        config.windows()?,
        config.drift_threshold,
    );
    let runner = JobRunner::new(pipeline, config.max_parallel_symbols);
    if let Some(secs) = max_runtime_secs {
        spawn_watchdog(runner.cancel_flag(), Duration::from_secs(secs));
    }
    Ok(runner)
}

fn spawn_watchdog(cancel: Arc<AtomicBool>, limit: Duration) {
    std::thread::spawn(move || {
        std::thread::sleep(limit);
        warn!(limit_secs = limit.as_secs(), "runtime limit reached, cancelling remaining symbols");
        cancel.store(true, Ordering::Relaxed);
    });
}

fn finnhub_provider(config: &PipelineConfig) -> Result<Option<FinnhubProvider>> {
    match &config.finnhub_api_key {
        Some(key) => Ok(Some(FinnhubProvider::new(
            &config.provider,
            key.clone(),
            config.crypto_vendor_map.clone(),
        )?)),
        None => {
            info!("FINNHUB_API_KEY not set, snapshots come from Yahoo");
            Ok(None)
        }
    }
}

fn pick_symbols(requested: Vec<String>, config: &PipelineConfig) -> Vec<String> {
    if requested.is_empty() {
        config.symbols.clone()
    } else {
        requested
    }
}

fn previous_utc_day() -> NaiveDate {
    DateRange::previous_utc_day(Utc::now()).start()
}

fn run_report_joined(
    store: &SqliteStore,
    symbol: &str,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    csv: Option<&Path>,
) -> Result<()> {
    let all = DateRange::everything();
    let start = start.unwrap_or(all.start());
    let end = end.unwrap_or(all.end());
    let Some(range) = DateRange::new(start, end) else {
        bail!("--start ({start}) is after --end ({end})");
    };

    let rows = store.joined(symbol, range)?;
    match csv {
        Some(path) => {
            write_joined_csv(&rows, path)?;
            info!(symbol, rows = rows.len(), path = %path.display(), "joined report written");
        }
        None => println!("{}", serde_json::to_string_pretty(&rows)?),
    }
    Ok(())
}

/// Print the summary; exit with status 1 when any symbol failed.
fn finish(summary: &JobSummary) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(summary)?);
    if summary.has_failures() {
        std::process::exit(1);
    }
    Ok(())
}
