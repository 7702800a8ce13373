//! Finnhub snapshot provider.
//!
//! Serves exactly one day per call. Symbols found in the crypto vendor map go
//! to the crypto candle endpoint under their vendor identifier; everything
//! else goes to the stock candle endpoint.

use chrono::{Duration, NaiveDate};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

use super::http;
use super::provider::{
    date_to_epoch, epoch_to_date, FetchOutcome, FinnhubCandle, PriceProvider, ProviderError,
    RawBar,
};
use super::retry::RetryPolicy;
use crate::config::{ProviderSettings, Secret};
use crate::domain::{DateRange, ProviderName};

/// Columnar candle payload. Arrays are absent when `s` is `no_data`.
#[derive(Debug, Deserialize)]
struct CandleResponse {
    s: String,
    #[serde(default)]
    t: Vec<i64>,
    #[serde(default)]
    o: Vec<f64>,
    #[serde(default)]
    h: Vec<f64>,
    #[serde(default)]
    l: Vec<f64>,
    #[serde(default)]
    c: Vec<f64>,
    #[serde(default)]
    v: Vec<f64>,
}

pub struct FinnhubProvider {
    client: Client,
    base_url: String,
    api_key: Secret,
    crypto_vendor_map: BTreeMap<String, String>,
    policy: RetryPolicy,
}

impl FinnhubProvider {
    pub fn new(
        settings: &ProviderSettings,
        api_key: Secret,
        crypto_vendor_map: BTreeMap<String, String>,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http::build_client(settings.timeout())?,
            base_url: settings.finnhub_base_url.trim_end_matches('/').to_string(),
            api_key,
            crypto_vendor_map,
            policy: settings.retry_policy(),
        })
    }

    /// Endpoint path and vendor symbol for `symbol`.
    fn route<'a>(&'a self, symbol: &'a str) -> (&'static str, &'a str) {
        match self.crypto_vendor_map.get(symbol) {
            Some(vendor) => ("crypto/candle", vendor.as_str()),
            None => ("stock/candle", symbol),
        }
    }

    fn query(&self, vendor_symbol: &str, day: NaiveDate) -> Vec<(&'static str, String)> {
        vec![
            ("symbol", vendor_symbol.to_string()),
            ("resolution", "D".to_string()),
            ("from", date_to_epoch(day).to_string()),
            ("to", date_to_epoch(day + Duration::days(1)).to_string()),
            ("token", self.api_key.expose().to_string()),
        ]
    }
}

/// Pick the candle whose UTC date is `day`.
fn candle_for_day(resp: CandleResponse, day: NaiveDate) -> Result<Option<FinnhubCandle>, String> {
    if resp.s != "ok" || resp.t.is_empty() {
        return Ok(None);
    }
    let n = resp.t.len();
    if [resp.o.len(), resp.h.len(), resp.l.len(), resp.c.len(), resp.v.len()]
        .iter()
        .any(|&len| len != n)
    {
        return Err("candle arrays have mismatched lengths".into());
    }

    Ok(resp
        .t
        .iter()
        .position(|&ts| epoch_to_date(ts) == Some(day))
        .map(|i| FinnhubCandle {
            timestamp: resp.t[i],
            open: resp.o[i],
            high: resp.h[i],
            low: resp.l[i],
            close: resp.c[i],
            volume: resp.v[i],
        }))
}

impl PriceProvider for FinnhubProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Finnhub
    }

    fn fetch(&self, symbol: &str, range: DateRange) -> Result<FetchOutcome, ProviderError> {
        if !range.is_single_day() {
            return Err(ProviderError::UnsupportedRange {
                provider: ProviderName::Finnhub,
                range,
                reason: "snapshot provider serves a single day".into(),
            });
        }
        let day = range.start();
        let (endpoint, vendor_symbol) = self.route(symbol);
        let url = format!("{}/{}", self.base_url, endpoint);

        let unavailable = |reason: String| ProviderError::Unavailable {
            provider: ProviderName::Finnhub,
            symbol: symbol.to_string(),
            reason,
        };

        let resp: CandleResponse =
            http::get_json(&self.client, &url, &self.query(vendor_symbol, day), &self.policy)
                .map_err(unavailable)?;
        debug!(symbol, vendor_symbol, endpoint, status = %resp.s, "finnhub fetch");

        match candle_for_day(resp, day).map_err(unavailable)? {
            Some(candle) => Ok(FetchOutcome::Bars(vec![RawBar::Finnhub(candle)])),
            None => Ok(FetchOutcome::NoDataForDate(day)),
        }
    }
}
