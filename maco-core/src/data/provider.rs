//! Price provider trait, provider-native record types, and structured errors.
//!
//! Every provider implements `PriceProvider`; which one a job uses is decided
//! by configuration, never by inspecting a provider at runtime. Provider-native
//! records stay in their own shape (`RawBar`) until the normalizer maps them.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{DateRange, ProviderName};

/// One Yahoo chart row. Any price column may be null in the vendor payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YahooRow {
    /// Epoch seconds.
    pub timestamp: i64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub adj_close: Option<f64>,
    pub volume: Option<u64>,
}

/// One Finnhub daily candle (vendor keys `t/o/h/l/c/v`). Volume is fractional
/// for crypto.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinnhubCandle {
    /// Epoch seconds.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// One generated row from the offline synthetic provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticRow {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// Provider-native record, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum RawBar {
    Yahoo(YahooRow),
    Finnhub(FinnhubCandle),
    Synthetic(SyntheticRow),
}

impl RawBar {
    pub fn provider(&self) -> ProviderName {
        match self {
            RawBar::Yahoo(_) => ProviderName::Yahoo,
            RawBar::Finnhub(_) => ProviderName::Finnhub,
            RawBar::Synthetic(_) => ProviderName::Synthetic,
        }
    }
}

/// UTC calendar date of an epoch-seconds timestamp.
pub fn epoch_to_date(ts: i64) -> Option<NaiveDate> {
    chrono::DateTime::from_timestamp(ts, 0).map(|dt| dt.date_naive())
}

/// Epoch seconds of `date` at 00:00 UTC.
pub fn date_to_epoch(date: NaiveDate) -> i64 {
    date.and_time(chrono::NaiveTime::MIN).and_utc().timestamp()
}

/// Successful outcome of a fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Bars(Vec<RawBar>),
    /// The provider answered but has nothing for this day. Not an error: the
    /// caller falls back to another provider.
    NoDataForDate(NaiveDate),
}

/// Structured provider errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network or vendor failure after the single allowed retry. Retriable at
    /// job level only.
    #[error("{provider} unavailable for {symbol}: {reason}")]
    Unavailable {
        provider: ProviderName,
        symbol: String,
        reason: String,
    },

    #[error("{provider} cannot serve range {range}: {reason}")]
    UnsupportedRange {
        provider: ProviderName,
        range: DateRange,
        reason: String,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// A source of daily bars.
///
/// Implementations handle one vendor's transport and payload shape. They do
/// not normalize, validate, or retry beyond the single rate-limit retry.
pub trait PriceProvider: Send + Sync {
    fn name(&self) -> ProviderName;

    /// Fetch daily bars for `symbol` within `range` (inclusive).
    fn fetch(&self, symbol: &str, range: DateRange) -> Result<FetchOutcome, ProviderError>;
}
