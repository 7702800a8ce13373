//! Yahoo Finance bulk provider.
//!
//! Fetches daily OHLCV bars from Yahoo's v8 chart API for arbitrary ranges.
//! Used for backfills and as the single-day fallback when the snapshot
//! provider has nothing.
//!
//! Yahoo has no official API and its payload format changes without notice;
//! a body that does not parse is reported as `Unavailable`.

use chrono::Duration;
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::debug;

use super::http;
use super::provider::{
    date_to_epoch, epoch_to_date, FetchOutcome, PriceProvider, ProviderError, RawBar, YahooRow,
};
use super::retry::RetryPolicy;
use crate::config::ProviderSettings;
use crate::domain::{DateRange, ProviderName};

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
    adjclose: Option<Vec<AdjCloseData>>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<u64>>,
}

#[derive(Debug, Deserialize)]
struct AdjCloseData {
    adjclose: Vec<Option<f64>>,
}

/// Yahoo Finance chart API provider.
pub struct YahooProvider {
    client: Client,
    base_url: String,
    policy: RetryPolicy,
}

impl YahooProvider {
    pub fn new(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http::build_client(settings.timeout())?,
            base_url: settings.yahoo_base_url.trim_end_matches('/').to_string(),
            policy: settings.retry_policy(),
        })
    }

    /// `period2` is exclusive, so it points at 00:00 UTC of the day after
    /// the range end.
    fn query(range: DateRange) -> Vec<(&'static str, String)> {
        vec![
            ("period1", date_to_epoch(range.start()).to_string()),
            ("period2", date_to_epoch(range.end() + Duration::days(1)).to_string()),
            ("interval", "1d".to_string()),
            ("includeAdjustedClose", "true".to_string()),
        ]
    }

    fn unavailable(symbol: &str, reason: impl Into<String>) -> ProviderError {
        ProviderError::Unavailable {
            provider: ProviderName::Yahoo,
            symbol: symbol.to_string(),
            reason: reason.into(),
        }
    }
}

/// Flatten the columnar chart payload into one row per timestamp inside
/// `range`. Rows where every column is null (holidays) are dropped.
fn parse_response(range: DateRange, resp: ChartResponse) -> Result<Vec<YahooRow>, String> {
    let result = match resp.chart.result {
        Some(result) => result,
        None => {
            return Err(match resp.chart.error {
                Some(err) => format!("{}: {}", err.code, err.description),
                None => "empty result with no error".into(),
            })
        }
    };

    // A range with no sessions comes back as a result without timestamps.
    let Some(data) = result.into_iter().next() else {
        return Ok(Vec::new());
    };
    let Some(timestamps) = data.timestamp else {
        return Ok(Vec::new());
    };

    let quote = data
        .indicators
        .quote
        .into_iter()
        .next()
        .ok_or_else(|| "no quote data".to_string())?;

    let adj_closes = data
        .indicators
        .adjclose
        .and_then(|v| v.into_iter().next())
        .map(|a| a.adjclose);

    let mut rows = Vec::with_capacity(timestamps.len());
    for (i, &ts) in timestamps.iter().enumerate() {
        let date = epoch_to_date(ts).ok_or_else(|| format!("invalid timestamp: {ts}"))?;
        if !range.contains(date) {
            continue;
        }

        let row = YahooRow {
            timestamp: ts,
            open: quote.open.get(i).copied().flatten(),
            high: quote.high.get(i).copied().flatten(),
            low: quote.low.get(i).copied().flatten(),
            close: quote.close.get(i).copied().flatten(),
            adj_close: adj_closes.as_ref().and_then(|v| v.get(i).copied().flatten()),
            volume: quote.volume.get(i).copied().flatten(),
        };

        if row.open.is_none()
            && row.high.is_none()
            && row.low.is_none()
            && row.close.is_none()
            && row.volume.is_none()
        {
            continue;
        }
        rows.push(row);
    }
    Ok(rows)
}

impl PriceProvider for YahooProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Yahoo
    }

    fn fetch(&self, symbol: &str, range: DateRange) -> Result<FetchOutcome, ProviderError> {
        let url = format!("{}/{}", self.base_url, symbol);
        let chart: ChartResponse = http::get_json(&self.client, &url, &Self::query(range), &self.policy)
            .map_err(|reason| Self::unavailable(symbol, reason))?;

        let rows = parse_response(range, chart).map_err(|reason| Self::unavailable(symbol, reason))?;
        debug!(symbol, %range, rows = rows.len(), "yahoo fetch");

        if rows.is_empty() && range.is_single_day() {
            return Ok(FetchOutcome::NoDataForDate(range.start()));
        }
        Ok(FetchOutcome::Bars(rows.into_iter().map(RawBar::Yahoo).collect()))
    }
}
