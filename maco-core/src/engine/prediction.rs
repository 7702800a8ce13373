//! Next-day projection from the latest features.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::signals::transition;
use crate::domain::{CrossSign, Direction, Feature, PriceBar, Prediction, SignalKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PredictionError {
    #[error("no bars to project from for {symbol}")]
    NoBars { symbol: String },
}

/// Project the next close and signal as of `latest.trade_date`.
///
/// `recent` holds the most recent bars in ascending order; only the last two
/// are read. `state` is the crossover sign after `latest`.
///
/// The projected close extrapolates the fast SMA one step:
/// `fast_t + (fast_t - fast_{t-1})`, with no slope when `fast_{t-1}` is
/// undefined and the latest close when `fast_t` is.
pub fn predict(
    latest: &Feature,
    previous: Option<&Feature>,
    recent: &[PriceBar],
    state: CrossSign,
    generated_at: DateTime<Utc>,
) -> Result<Prediction, PredictionError> {
    let last = recent.last().ok_or_else(|| PredictionError::NoBars {
        symbol: latest.symbol.clone(),
    })?;

    let predicted_direction = match recent.len().checked_sub(2).map(|i| &recent[i]) {
        Some(prev) if last.close > prev.close => Direction::Up,
        Some(prev) if last.close < prev.close => Direction::Down,
        _ => Direction::Flat,
    };

    let predicted_close = match latest.sma_fast {
        Some(fast) => {
            let slope = previous
                .and_then(|p| p.sma_fast)
                .map_or(0.0, |prev_fast| fast - prev_fast);
            fast + slope
        }
        None => last.close,
    };

    let predicted_signal = match latest.sma_slow {
        Some(slow) => transition(state, Some(predicted_close - slow)).0,
        None => SignalKind::Hold,
    };

    Ok(Prediction {
        symbol: latest.symbol.clone(),
        trade_date: latest.trade_date,
        predicted_signal,
        predicted_direction,
        predicted_close,
        generated_at,
    })
}
