//! Fast/slow simple moving averages over daily closes.
//!
//! Both values for a date are null until the series holds `max(fast, slow)`
//! bars up to and including that date. Each mean is summed fresh over its
//! own window, so a run resumed from a trailing window produces exactly the
//! values a full recomputation does.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

use crate::domain::{Feature, PriceBar};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeatureError {
    #[error("SMA windows must be >= 1 (fast {fast}, slow {slow})")]
    InvalidWindows { fast: usize, slow: usize },

    #[error("bars are not strictly ascending at {date}")]
    Unordered { date: NaiveDate },

    #[error("history tail has {got} bars, expected {expected}")]
    TailLength { got: usize, expected: usize },

    #[error("history tail ends {tail_end:?} but prior features end {features_end:?}")]
    TailMismatch {
        tail_end: Option<NaiveDate>,
        features_end: Option<NaiveDate>,
    },
}

/// Validated window pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmaWindows {
    fast: usize,
    slow: usize,
}

impl SmaWindows {
    pub fn new(fast: usize, slow: usize) -> Result<Self, FeatureError> {
        if fast == 0 || slow == 0 {
            return Err(FeatureError::InvalidWindows { fast, slow });
        }
        Ok(Self { fast, slow })
    }

    pub fn fast(&self) -> usize {
        self.fast
    }

    pub fn slow(&self) -> usize {
        self.slow
    }

    /// Bars needed before any value is defined.
    pub fn warmup(&self) -> usize {
        self.fast.max(self.slow)
    }
}

/// Trailing closes plus the count of bars seen so far.
struct SmaState {
    windows: SmaWindows,
    closes: VecDeque<f64>,
    seen: usize,
}

impl SmaState {
    fn new(windows: SmaWindows) -> Self {
        Self {
            windows,
            closes: VecDeque::with_capacity(windows.warmup() + 1),
            seen: 0,
        }
    }

    fn resume(windows: SmaWindows, tail: &[PriceBar], seen: usize) -> Self {
        let mut state = Self::new(windows);
        state.closes.extend(tail.iter().map(|b| b.close));
        state.seen = seen;
        state
    }

    fn mean_of_last(&self, n: usize) -> f64 {
        let sum: f64 = self.closes.iter().rev().take(n).sum();
        sum / n as f64
    }

    fn push(&mut self, close: f64) -> (Option<f64>, Option<f64>) {
        self.closes.push_back(close);
        if self.closes.len() > self.windows.warmup() {
            self.closes.pop_front();
        }
        self.seen += 1;

        if self.seen < self.windows.warmup() {
            return (None, None);
        }
        (
            Some(self.mean_of_last(self.windows.fast)),
            Some(self.mean_of_last(self.windows.slow)),
        )
    }
}

fn check_ascending(bars: &[PriceBar], after: Option<NaiveDate>) -> Result<(), FeatureError> {
    let mut prev = after;
    for bar in bars {
        if prev.is_some_and(|p| bar.trade_date <= p) {
            return Err(FeatureError::Unordered {
                date: bar.trade_date,
            });
        }
        prev = Some(bar.trade_date);
    }
    Ok(())
}

fn run(state: &mut SmaState, bars: &[PriceBar]) -> Vec<Feature> {
    bars.iter()
        .map(|bar| {
            let (sma_fast, sma_slow) = state.push(bar.close);
            Feature {
                symbol: bar.symbol.clone(),
                trade_date: bar.trade_date,
                sma_fast,
                sma_slow,
            }
        })
        .collect()
}

/// Features for every bar of an ascending series.
pub fn compute_features(bars: &[PriceBar], windows: SmaWindows) -> Result<Vec<Feature>, FeatureError> {
    check_ascending(bars, None)?;
    Ok(run(&mut SmaState::new(windows), bars))
}

/// Features for `new_bars` only, continuing a history.
///
/// `prior` holds one feature per historical bar; `tail` holds the last
/// `min(warmup, prior.len())` historical bars. The result equals the
/// corresponding suffix of `compute_features` over the whole history.
pub fn extend_features(
    prior: &[Feature],
    tail: &[PriceBar],
    new_bars: &[PriceBar],
    windows: SmaWindows,
) -> Result<Vec<Feature>, FeatureError> {
    let expected = windows.warmup().min(prior.len());
    if tail.len() != expected {
        return Err(FeatureError::TailLength {
            got: tail.len(),
            expected,
        });
    }

    let tail_end = tail.last().map(|b| b.trade_date);
    let features_end = prior.last().map(|f| f.trade_date);
    if tail_end != features_end {
        return Err(FeatureError::TailMismatch {
            tail_end,
            features_end,
        });
    }

    check_ascending(tail, None)?;
    check_ascending(new_bars, tail_end)?;
    Ok(run(&mut SmaState::resume(windows, tail, prior.len()), new_bars))
}
