//! Audit records for quarantined and drift-flagged bars.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::ProviderName;

/// A raw bar that failed validation and never reached the canonical store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedBar {
    pub symbol: String,
    pub provider: ProviderName,
    /// `None` when the raw timestamp itself was unusable.
    pub trade_date: Option<NaiveDate>,
    pub reason: String,
    /// Provider-native record as JSON.
    pub payload: serde_json::Value,
    pub rejected_at: DateTime<Utc>,
}

/// An accepted bar whose day-over-day close return exceeded the drift threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftFlag {
    pub symbol: String,
    pub trade_date: NaiveDate,
    pub provider: ProviderName,
    pub prev_close: f64,
    pub close: f64,
    pub day_return: f64,
    pub threshold: f64,
    pub flagged_at: DateTime<Utc>,
}
