//! Crossover signal types.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Trading signal emitted for one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    Buy,
    Sell,
    Hold,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Buy => "BUY",
            SignalKind::Sell => "SELL",
            SignalKind::Hold => "HOLD",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(SignalKind::Buy),
            "SELL" => Ok(SignalKind::Sell),
            "HOLD" => Ok(SignalKind::Hold),
            other => Err(format!("unknown signal '{other}'")),
        }
    }
}

/// Carried sign of `sma_fast - sma_slow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CrossSign {
    Pos,
    Neg,
    #[default]
    Undefined,
}

impl CrossSign {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrossSign::Pos => "POS",
            CrossSign::Neg => "NEG",
            CrossSign::Undefined => "UNDEFINED",
        }
    }
}

impl fmt::Display for CrossSign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrossSign {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "POS" => Ok(CrossSign::Pos),
            "NEG" => Ok(CrossSign::Neg),
            "UNDEFINED" => Ok(CrossSign::Undefined),
            other => Err(format!("unknown crossover sign '{other}'")),
        }
    }
}

/// Signal row: one per `(symbol, trade_date)`.
///
/// `crossover_sign` is the sign state after processing `trade_date`, which is
/// what a later incremental run resumes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub trade_date: NaiveDate,
    pub signal: SignalKind,
    pub crossover_sign: CrossSign,
}
