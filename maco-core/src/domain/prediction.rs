//! Next-day projections, appended after every derive run.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::SignalKind;

/// Expected direction of the next close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Up,
    Down,
    Flat,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "UP",
            Direction::Down => "DOWN",
            Direction::Flat => "FLAT",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UP" => Ok(Direction::Up),
            "DOWN" => Ok(Direction::Down),
            "FLAT" => Ok(Direction::Flat),
            other => Err(format!("unknown direction '{other}'")),
        }
    }
}

/// Next-day projection made as of `trade_date`.
///
/// Append-only: every run adds a row. Readers take the latest `generated_at`
/// per `(symbol, trade_date)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub symbol: String,
    pub trade_date: NaiveDate,
    pub predicted_signal: SignalKind,
    pub predicted_direction: Direction,
    pub predicted_close: f64,
    pub generated_at: DateTime<Utc>,
}

impl Prediction {
    /// Equal in every field except `generated_at`.
    pub fn same_projection(&self, other: &Prediction) -> bool {
        self.symbol == other.symbol
            && self.trade_date == other.trade_date
            && self.predicted_signal == other.predicted_signal
            && self.predicted_direction == other.predicted_direction
            && self.predicted_close == other.predicted_close
    }
}
