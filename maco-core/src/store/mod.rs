//! Canonical store: the keyed, idempotently upsertable home of every bar,
//! feature, signal, and prediction, plus the audit logs.

pub mod sqlite;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::domain::{
    CrossSign, DateRange, Direction, DriftFlag, Feature, PriceBar, Prediction, ProviderName,
    RejectedBar, Signal, SignalKind,
};

pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A keyed upsert touched a row count other than one. Indicates a key
    /// generation bug; the whole batch is rolled back.
    #[error("merge conflict in {table} at ({symbol}, {trade_date}): {rows} rows affected")]
    MergeConflict {
        table: &'static str,
        symbol: String,
        trade_date: NaiveDate,
        rows: usize,
    },

    #[error("store lock poisoned")]
    Poisoned,

    #[error("encode audit payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// One canonical bar joined with its derived rows. Columns from a missing
/// derived row are `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinedRow {
    pub symbol: String,
    pub trade_date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub adj_close: Option<f64>,
    pub volume: u64,
    pub provider: ProviderName,
    pub sma_fast: Option<f64>,
    pub sma_slow: Option<f64>,
    pub signal: Option<SignalKind>,
    pub crossover_sign: Option<CrossSign>,
    pub predicted_signal: Option<SignalKind>,
    pub predicted_direction: Option<Direction>,
    pub predicted_close: Option<f64>,
    pub generated_at: Option<DateTime<Utc>>,
}

/// Earliest bar date written since derived rows were last rebuilt.
///
/// Every bar insert or update moves `from_date` back to the written date
/// and bumps `revision`, so a derive run can tell whether writes landed
/// while it was running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeriveBacklog {
    pub symbol: String,
    pub from_date: NaiveDate,
    pub revision: i64,
}

/// Keyed storage for the pipeline.
///
/// Bars, features, and signals are unique on `(symbol, trade_date)` and
/// written last-writer-wins, one transaction per batch. Predictions and
/// rejections are append-only.
pub trait CanonicalStore: Send + Sync {
    /// Upsert bars; `ingest_ts` is set to the write time. Returns rows committed.
    fn upsert_bars(&self, bars: &[PriceBar]) -> Result<usize, StoreError>;

    /// Bars in `range`, ascending by date.
    fn bars(&self, symbol: &str, range: DateRange) -> Result<Vec<PriceBar>, StoreError>;

    fn count_bars(&self, symbol: &str, range: DateRange) -> Result<usize, StoreError>;

    /// Most recent bar strictly before `date`.
    fn latest_bar_before(&self, symbol: &str, date: NaiveDate)
        -> Result<Option<PriceBar>, StoreError>;

    /// The last `n` bars on or before `date`, ascending.
    fn tail_bars(&self, symbol: &str, date: NaiveDate, n: usize)
        -> Result<Vec<PriceBar>, StoreError>;

    fn derive_backlog(&self, symbol: &str) -> Result<Option<DeriveBacklog>, StoreError>;

    /// Drop the backlog if no bar was written since it was read. Returns
    /// `false` when newer writes kept it in place.
    fn clear_derive_backlog(&self, backlog: &DeriveBacklog) -> Result<bool, StoreError>;

    fn upsert_features(&self, features: &[Feature]) -> Result<usize, StoreError>;

    fn features(&self, symbol: &str, range: DateRange) -> Result<Vec<Feature>, StoreError>;

    fn upsert_signals(&self, signals: &[Signal]) -> Result<usize, StoreError>;

    fn signals(&self, symbol: &str, range: DateRange) -> Result<Vec<Signal>, StoreError>;

    fn append_predictions(&self, predictions: &[Prediction]) -> Result<usize, StoreError>;

    /// Every prediction made for `(symbol, trade_date)`, oldest first.
    fn predictions(&self, symbol: &str, trade_date: NaiveDate)
        -> Result<Vec<Prediction>, StoreError>;

    /// Bars LEFT JOINed with feature, signal, and current prediction.
    fn joined(&self, symbol: &str, range: DateRange) -> Result<Vec<JoinedRow>, StoreError>;

    /// Per symbol, the latest-generated prediction whose trade date lies in
    /// `[as_of - lookback_days, as_of]`.
    fn latest_predictions(
        &self,
        as_of: NaiveDate,
        lookback_days: u32,
    ) -> Result<Vec<Prediction>, StoreError>;

    fn record_rejections(&self, rejected: &[RejectedBar]) -> Result<usize, StoreError>;

    fn rejections(&self, symbol: &str) -> Result<Vec<RejectedBar>, StoreError>;

    /// Upsert drift flags keyed on `(symbol, trade_date)`.
    fn record_drift(&self, flags: &[DriftFlag]) -> Result<usize, StoreError>;

    fn drift_flags(&self, symbol: &str) -> Result<Vec<DriftFlag>, StoreError>;
}
