//! Per-symbol outcomes and the job summary printed at the end of a run.

use chrono::{DateTime, NaiveDate, Utc};
use maco_core::domain::ProviderName;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Normalize,
    Merge,
    Feature,
    Signal,
    Predict,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Normalize => "normalize",
            Stage::Merge => "merge",
            Stage::Feature => "feature",
            Stage::Signal => "signal",
            Stage::Predict => "predict",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Backfill,
    Snapshot,
    Compute,
    Daily,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Backfill => "backfill",
            JobKind::Snapshot => "snapshot",
            JobKind::Compute => "compute",
            JobKind::Daily => "daily",
        }
    }
}

/// Row counts for one symbol's run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    /// Provider that supplied the bars, when the job fetched.
    pub provider: Option<ProviderName>,
    pub fetched: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub drift_flagged: usize,
    pub merged: usize,
    pub features: usize,
    pub signals: usize,
    pub predictions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SymbolOutcome {
    Completed { counts: StageCounts },
    /// Every provider answered but had nothing to offer.
    NoData { date: Option<NaiveDate> },
    Failed { stage: Stage, error: String },
    /// The job was cancelled before this symbol started.
    Cancelled,
}

impl SymbolOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, SymbolOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolReport {
    pub symbol: String,
    #[serde(flatten)]
    pub outcome: SymbolOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub run_id: String,
    pub job: JobKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub symbols: Vec<SymbolReport>,
}

impl JobSummary {
    pub fn has_failures(&self) -> bool {
        self.symbols.iter().any(|r| r.outcome.is_failed())
    }

    pub fn outcome(&self, symbol: &str) -> Option<&SymbolOutcome> {
        self.symbols
            .iter()
            .find(|r| r.symbol == symbol)
            .map(|r| &r.outcome)
    }

    /// `(completed, no_data, failed, cancelled)`
    pub fn tally(&self) -> (usize, usize, usize, usize) {
        self.symbols
            .iter()
            .fold((0, 0, 0, 0), |(c, n, f, x), r| match r.outcome {
                SymbolOutcome::Completed { .. } => (c + 1, n, f, x),
                SymbolOutcome::NoData { .. } => (c, n + 1, f, x),
                SymbolOutcome::Failed { .. } => (c, n, f + 1, x),
                SymbolOutcome::Cancelled => (c, n, f, x + 1),
            })
    }
}

/// Short run identifier: BLAKE3 over job kind, start time, and symbols.
pub fn run_id(job: JobKind, started_at: DateTime<Utc>, symbols: &[String]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(job.as_str().as_bytes());
    hasher.update(&started_at.timestamp_micros().to_le_bytes());
    for s in symbols {
        hasher.update(s.as_bytes());
        hasher.update(b"\0");
    }
    hasher.finalize().to_hex()[..16].to_string()
}
