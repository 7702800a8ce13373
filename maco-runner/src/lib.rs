//! MACO runner: job orchestration on top of `maco-core`.
//!
//! - Per-symbol pipeline (fetch, normalize, merge, feature, signal, predict)
//! - Backfill, snapshot, compute, and daily jobs with per-symbol outcomes
//! - CSV export of the joined report

pub mod export;
pub mod jobs;
pub mod pipeline;
pub mod summary;

pub use export::{export_joined_csv, write_joined_csv};
pub use jobs::{JobError, JobRunner};
pub use pipeline::{ComputeMode, Fetched, Pipeline, PipelineError, StageFailure};
pub use summary::{run_id, JobKind, JobSummary, Stage, StageCounts, SymbolOutcome, SymbolReport};
