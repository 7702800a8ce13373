//! SMA feature rows.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Fast/slow SMA pair for one symbol on one trade date.
///
/// Both values are `None` until the series holds enough bars to fill the
/// longer window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub symbol: String,
    pub trade_date: NaiveDate,
    pub sma_fast: Option<f64>,
    pub sma_slow: Option<f64>,
}

impl Feature {
    pub fn is_defined(&self) -> bool {
        self.sma_fast.is_some() && self.sma_slow.is_some()
    }

    /// `sma_fast - sma_slow`, when both are defined.
    pub fn spread(&self) -> Option<f64> {
        Some(self.sma_fast? - self.sma_slow?)
    }
}
