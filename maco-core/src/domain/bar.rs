//! PriceBar, the canonical daily OHLCV row.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which provider produced a bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    Yahoo,
    Finnhub,
    Synthetic,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::Yahoo => "yahoo",
            ProviderName::Finnhub => "finnhub",
            ProviderName::Synthetic => "synthetic",
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "yahoo" => Ok(ProviderName::Yahoo),
            "finnhub" => Ok(ProviderName::Finnhub),
            "synthetic" => Ok(ProviderName::Synthetic),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}

/// OHLCV bar for a single symbol on a single trading day.
///
/// Rows are unique on `(symbol, trade_date)` in the canonical store.
/// `ingest_ts` is owned by the store: it is rewritten to the write time on
/// every upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub symbol: String,
    pub trade_date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub adj_close: Option<f64>,
    pub volume: u64,
    pub provider: ProviderName,
    pub ingest_ts: DateTime<Utc>,
}

impl PriceBar {
    /// `low <= open <= high` and `low <= close <= high`.
    pub fn is_in_range(&self) -> bool {
        self.low <= self.open
            && self.open <= self.high
            && self.low <= self.close
            && self.close <= self.high
    }

    /// All fields equal except `ingest_ts`.
    pub fn same_content(&self, other: &PriceBar) -> bool {
        self.symbol == other.symbol
            && self.trade_date == other.trade_date
            && self.open == other.open
            && self.high == other.high
            && self.low == other.low
            && self.close == other.close
            && self.adj_close == other.adj_close
            && self.volume == other.volume
            && self.provider == other.provider
    }
}
