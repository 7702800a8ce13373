//! Offline synthetic provider.
//!
//! Generates a deterministic random walk per symbol so the full pipeline can
//! run without network access. The walk always starts at a fixed origin, so
//! a given `(symbol, date)` gets the same bar no matter which range asked
//! for it. Weekends are skipped.

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::provider::{FetchOutcome, PriceProvider, ProviderError, RawBar, SyntheticRow};
use crate::domain::{DateRange, ProviderName};

#[derive(Debug, Clone)]
pub struct SyntheticProvider {
    origin: NaiveDate,
}

impl Default for SyntheticProvider {
    fn default() -> Self {
        Self {
            origin: NaiveDate::from_ymd_opt(2000, 1, 3).unwrap_or(NaiveDate::MIN),
        }
    }
}

impl SyntheticProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the walk at `origin` instead of the default.
    pub fn with_origin(origin: NaiveDate) -> Self {
        Self { origin }
    }

    fn generate(&self, symbol: &str, range: DateRange) -> Vec<SyntheticRow> {
        let seed: [u8; 32] = *blake3::hash(symbol.as_bytes()).as_bytes();
        let mut rng = StdRng::from_seed(seed);

        let mut rows = Vec::new();
        let mut price = 100.0_f64;
        let mut current = self.origin;

        while current <= range.end() {
            if matches!(current.weekday(), Weekday::Sat | Weekday::Sun) {
                current += Duration::days(1);
                continue;
            }

            let daily_return: f64 = rng.gen_range(-0.03..0.03);
            let open = price;
            let close = price * (1.0 + daily_return);
            let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.01));
            let low = open.min(close) * (1.0 - rng.gen_range(0.0..0.01));
            let volume = rng.gen_range(500_000..5_000_000u64);

            if current >= range.start() {
                rows.push(SyntheticRow {
                    date: current,
                    open,
                    high,
                    low,
                    close,
                    volume,
                });
            }

            price = close;
            current += Duration::days(1);
        }
        rows
    }
}

impl PriceProvider for SyntheticProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Synthetic
    }

    fn fetch(&self, symbol: &str, range: DateRange) -> Result<FetchOutcome, ProviderError> {
        let rows = self.generate(symbol, range);
        if rows.is_empty() && range.is_single_day() {
            return Ok(FetchOutcome::NoDataForDate(range.start()));
        }
        Ok(FetchOutcome::Bars(rows.into_iter().map(RawBar::Synthetic).collect()))
    }
}
