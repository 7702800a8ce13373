//! Jobs: run the per-symbol pipeline across a symbol list in parallel.
//!
//! A failing symbol never aborts the batch. Each symbol ends up in the
//! summary as completed, no-data, failed (with the stage), or cancelled.

use chrono::{NaiveDate, Utc};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

use maco_core::data::PriceProvider;
use maco_core::domain::DateRange;

use crate::pipeline::{ComputeMode, Fetched, Pipeline, StageFailure};
use crate::summary::{run_id, JobKind, JobSummary, StageCounts, SymbolOutcome, SymbolReport};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("no symbols to process")]
    NoSymbols,

    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Runs jobs against one pipeline.
pub struct JobRunner {
    pipeline: Pipeline,
    max_parallel: usize,
    cancel: Arc<AtomicBool>,
}

impl JobRunner {
    /// `max_parallel` of 0 means one worker per symbol.
    pub fn new(pipeline: Pipeline, max_parallel: usize) -> Self {
        Self {
            pipeline,
            max_parallel,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Flag that stops the job before any further symbol starts.
    /// Symbols already in flight finish their current run.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Fetch `range` from the bulk provider, merge, and recompute derived
    /// series in full.
    pub fn run_backfill(
        &self,
        provider: &dyn PriceProvider,
        symbols: &[String],
        range: DateRange,
    ) -> Result<JobSummary, JobError> {
        self.run_each(JobKind::Backfill, symbols, |symbol| {
            let mut counts = StageCounts::default();
            match self.pipeline.fetch(provider, symbol, range)? {
                Fetched::NoData(day) => return Ok(SymbolOutcome::NoData { date: Some(day) }),
                Fetched::Bars { provider, raws } => {
                    self.pipeline.ingest(symbol, provider, &raws, range, &mut counts)?
                }
            }
            self.pipeline
                .derive(symbol, ComputeMode::Full, Utc::now(), &mut counts)?;
            Ok(SymbolOutcome::Completed { counts })
        })
    }

    /// Ingest one day, preferring `snapshot` and falling back to `fallback`.
    pub fn run_snapshot(
        &self,
        snapshot: Option<&dyn PriceProvider>,
        fallback: &dyn PriceProvider,
        symbols: &[String],
        day: NaiveDate,
    ) -> Result<JobSummary, JobError> {
        self.run_each(JobKind::Snapshot, symbols, |symbol| {
            let mut counts = StageCounts::default();
            if !self.ingest_day(snapshot, fallback, symbol, day, &mut counts)? {
                return Ok(SymbolOutcome::NoData { date: Some(day) });
            }
            Ok(SymbolOutcome::Completed { counts })
        })
    }

    /// Bring features, signals, and predictions up to date from stored bars.
    pub fn run_compute(&self, symbols: &[String], mode: ComputeMode) -> Result<JobSummary, JobError> {
        self.run_each(JobKind::Compute, symbols, |symbol| {
            let mut counts = StageCounts::default();
            self.pipeline.derive(symbol, mode, Utc::now(), &mut counts)?;
            Ok(SymbolOutcome::Completed { counts })
        })
    }

    /// The scheduled job: snapshot for `day`, then incremental compute.
    ///
    /// A symbol with no data for `day` still gets its derived series
    /// refreshed, but reports `NoData`.
    pub fn run_daily(
        &self,
        snapshot: Option<&dyn PriceProvider>,
        fallback: &dyn PriceProvider,
        symbols: &[String],
        day: NaiveDate,
    ) -> Result<JobSummary, JobError> {
        self.run_each(JobKind::Daily, symbols, |symbol| {
            let mut counts = StageCounts::default();
            let found = self.ingest_day(snapshot, fallback, symbol, day, &mut counts)?;
            self.pipeline
                .derive(symbol, ComputeMode::Incremental, Utc::now(), &mut counts)?;
            if found {
                Ok(SymbolOutcome::Completed { counts })
            } else {
                Ok(SymbolOutcome::NoData { date: Some(day) })
            }
        })
    }

    /// Returns `false` when no provider had a bar for `day`.
    fn ingest_day(
        &self,
        snapshot: Option<&dyn PriceProvider>,
        fallback: &dyn PriceProvider,
        symbol: &str,
        day: NaiveDate,
        counts: &mut StageCounts,
    ) -> Result<bool, StageFailure> {
        match self
            .pipeline
            .fetch_day_with_fallback(snapshot, fallback, symbol, day)?
        {
            Fetched::NoData(_) => Ok(false),
            Fetched::Bars { provider, raws } => {
                self.pipeline
                    .ingest(symbol, provider, &raws, DateRange::single(day), counts)?;
                Ok(true)
            }
        }
    }

    fn run_each<F>(&self, job: JobKind, symbols: &[String], work: F) -> Result<JobSummary, JobError>
    where
        F: Fn(&str) -> Result<SymbolOutcome, StageFailure> + Sync,
    {
        if symbols.is_empty() {
            return Err(JobError::NoSymbols);
        }

        let started_at = Utc::now();
        let run_id = run_id(job, started_at, symbols);
        let threads = match self.max_parallel {
            0 => symbols.len(),
            n => n.min(symbols.len()),
        };
        let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build()?;
        info!(run_id = %run_id, job = job.as_str(), symbols = symbols.len(), threads, "job started");

        let reports: Vec<SymbolReport> = pool.install(|| {
            symbols
                .par_iter()
                .map(|symbol| {
                    let outcome = if self.cancel.load(Ordering::Relaxed) {
                        info!(run_id = %run_id, symbol = %symbol, "cancelled before start");
                        SymbolOutcome::Cancelled
                    } else {
                        match work(symbol) {
                            Ok(outcome) => outcome,
                            Err(failure) => {
                                error!(run_id = %run_id, symbol = %symbol, stage = %failure.stage,
                                    error = %failure.source, "symbol failed");
                                SymbolOutcome::Failed {
                                    stage: failure.stage,
                                    error: failure.source.to_string(),
                                }
                            }
                        }
                    };
                    SymbolReport {
                        symbol: symbol.clone(),
                        outcome,
                    }
                })
                .collect()
        });

        let summary = JobSummary {
            run_id,
            job,
            started_at,
            finished_at: Utc::now(),
            symbols: reports,
        };
        let (completed, no_data, failed, cancelled) = summary.tally();
        info!(run_id = %summary.run_id, job = job.as_str(), completed, no_data, failed, cancelled,
            "job finished");
        Ok(summary)
    }
}
