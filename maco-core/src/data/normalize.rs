//! Provider-native records → canonical `PriceBar`s.
//!
//! Each provider has one total mapping function. Records that fail validation
//! are quarantined as `RejectedBar`s and never reach the store. Accepted bars
//! are ordered by date, collapsed to one per date, and drift-checked against
//! the previous accepted close.

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tracing::warn;

use super::provider::{epoch_to_date, FinnhubCandle, RawBar, SyntheticRow, YahooRow};
use crate::domain::{DriftFlag, PriceBar, ProviderName, RejectedBar};

/// Why a raw record was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationFailure {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("timestamp {0} is not a valid date")]
    InvalidTimestamp(i64),

    #[error("{field} must be a positive finite number, got {value}")]
    BadPrice { field: &'static str, value: f64 },

    #[error("volume must be a non-negative finite number, got {0}")]
    BadVolume(f64),

    #[error("prices out of range: open {open} high {high} low {low} close {close}")]
    OutOfRange {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
}

/// Result of normalizing one fetched batch.
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    /// Ascending by date, one per date.
    pub accepted: Vec<PriceBar>,
    pub rejected: Vec<RejectedBar>,
    pub drift: Vec<DriftFlag>,
}

/// Map one raw record to a canonical bar for `symbol`.
pub fn normalize(
    raw: &RawBar,
    symbol: &str,
    ingest_ts: DateTime<Utc>,
) -> Result<PriceBar, ValidationFailure> {
    let bar = match raw {
        RawBar::Yahoo(row) => from_yahoo(row, symbol, ingest_ts)?,
        RawBar::Finnhub(candle) => from_finnhub(candle, symbol, ingest_ts)?,
        RawBar::Synthetic(row) => from_synthetic(row, symbol, ingest_ts),
    };
    validate(&bar)?;
    Ok(bar)
}

/// Trade date of a raw record, if its timestamp is usable.
pub fn raw_trade_date(raw: &RawBar) -> Option<NaiveDate> {
    match raw {
        RawBar::Yahoo(row) => epoch_to_date(row.timestamp),
        RawBar::Finnhub(candle) => epoch_to_date(candle.timestamp),
        RawBar::Synthetic(row) => Some(row.date),
    }
}

fn from_yahoo(
    row: &YahooRow,
    symbol: &str,
    ingest_ts: DateTime<Utc>,
) -> Result<PriceBar, ValidationFailure> {
    let trade_date =
        epoch_to_date(row.timestamp).ok_or(ValidationFailure::InvalidTimestamp(row.timestamp))?;
    Ok(PriceBar {
        symbol: symbol.to_string(),
        trade_date,
        open: row.open.ok_or(ValidationFailure::MissingField("open"))?,
        high: row.high.ok_or(ValidationFailure::MissingField("high"))?,
        low: row.low.ok_or(ValidationFailure::MissingField("low"))?,
        close: row.close.ok_or(ValidationFailure::MissingField("close"))?,
        adj_close: row.adj_close,
        volume: row.volume.unwrap_or(0),
        provider: ProviderName::Yahoo,
        ingest_ts,
    })
}

fn from_finnhub(
    candle: &FinnhubCandle,
    symbol: &str,
    ingest_ts: DateTime<Utc>,
) -> Result<PriceBar, ValidationFailure> {
    let trade_date = epoch_to_date(candle.timestamp)
        .ok_or(ValidationFailure::InvalidTimestamp(candle.timestamp))?;
    if !candle.volume.is_finite() || candle.volume < 0.0 {
        return Err(ValidationFailure::BadVolume(candle.volume));
    }
    Ok(PriceBar {
        symbol: symbol.to_string(),
        trade_date,
        open: candle.open,
        high: candle.high,
        low: candle.low,
        close: candle.close,
        adj_close: None,
        volume: candle.volume.round() as u64,
        provider: ProviderName::Finnhub,
        ingest_ts,
    })
}

fn from_synthetic(row: &SyntheticRow, symbol: &str, ingest_ts: DateTime<Utc>) -> PriceBar {
    PriceBar {
        symbol: symbol.to_string(),
        trade_date: row.date,
        open: row.open,
        high: row.high,
        low: row.low,
        close: row.close,
        adj_close: Some(row.close),
        volume: row.volume,
        provider: ProviderName::Synthetic,
        ingest_ts,
    }
}

fn validate(bar: &PriceBar) -> Result<(), ValidationFailure> {
    for (field, value) in [
        ("open", bar.open),
        ("high", bar.high),
        ("low", bar.low),
        ("close", bar.close),
    ] {
        if !value.is_finite() || value <= 0.0 {
            return Err(ValidationFailure::BadPrice { field, value });
        }
    }
    if let Some(adj) = bar.adj_close {
        if !adj.is_finite() || adj <= 0.0 {
            return Err(ValidationFailure::BadPrice {
                field: "adj_close",
                value: adj,
            });
        }
    }
    if !bar.is_in_range() {
        return Err(ValidationFailure::OutOfRange {
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
        });
    }
    Ok(())
}

/// Normalize a fetched batch for one symbol.
///
/// `prior_close` is the last stored close before the batch; it seeds the
/// drift check for the first accepted bar.
pub fn normalize_batch(
    raws: &[RawBar],
    symbol: &str,
    prior_close: Option<f64>,
    drift_threshold: f64,
    now: DateTime<Utc>,
) -> NormalizedBatch {
    let mut out = NormalizedBatch::default();
    let mut accepted = Vec::with_capacity(raws.len());

    for raw in raws {
        match normalize(raw, symbol, now) {
            Ok(bar) => accepted.push(bar),
            Err(failure) => {
                let trade_date = raw_trade_date(raw);
                warn!(
                    symbol,
                    provider = %raw.provider(),
                    trade_date = ?trade_date,
                    reason = %failure,
                    "bar rejected"
                );
                out.rejected.push(RejectedBar {
                    symbol: symbol.to_string(),
                    provider: raw.provider(),
                    trade_date,
                    reason: failure.to_string(),
                    payload: serde_json::to_value(raw).unwrap_or(serde_json::Value::Null),
                    rejected_at: now,
                });
            }
        }
    }

    // Stable sort keeps input order within a date, so the last of each run wins.
    accepted.sort_by_key(|b| b.trade_date);
    for bar in accepted {
        match out.accepted.last_mut() {
            Some(last) if last.trade_date == bar.trade_date => *last = bar,
            _ => out.accepted.push(bar),
        }
    }

    let mut prev_close = prior_close;
    for bar in &out.accepted {
        if let Some(prev) = prev_close {
            let day_return = bar.close / prev - 1.0;
            if day_return.abs() > drift_threshold {
                warn!(
                    symbol,
                    trade_date = %bar.trade_date,
                    prev_close = prev,
                    close = bar.close,
                    day_return,
                    "price drift above threshold"
                );
                out.drift.push(DriftFlag {
                    symbol: symbol.to_string(),
                    trade_date: bar.trade_date,
                    provider: bar.provider,
                    prev_close: prev,
                    close: bar.close,
                    day_return,
                    threshold: drift_threshold,
                    flagged_at: now,
                });
            }
        }
        prev_close = Some(bar.close);
    }

    out
}
