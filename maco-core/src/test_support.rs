use chrono::{Duration, NaiveDate, TimeZone, Utc};

use crate::domain::{PriceBar, ProviderName};

/// Consecutive daily bars from 2024-01-01 with the given closes.
pub(crate) fn bars_from_closes(symbol: &str, closes: &[f64]) -> Vec<PriceBar> {
    let base = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let ingest_ts = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| PriceBar {
            symbol: symbol.to_string(),
            trade_date: base + Duration::days(i as i64),
            open: close,
            high: close + 1.0,
            low: (close - 1.0).max(0.01),
            close,
            adj_close: Some(close),
            volume: 1_000,
            provider: ProviderName::Yahoo,
            ingest_ts,
        })
        .collect()
}
