//! Moving-average crossover state machine.
//!
//! State is the sign of `sma_fast - sma_slow` carried from the prior date:
//! - NEG → POS emits BUY (golden cross)
//! - POS → NEG emits SELL (death cross)
//! - everything else emits HOLD
//!
//! Equal averages and undefined features keep the previous sign. Leaving
//! UNDEFINED only establishes the state.

use crate::domain::{CrossSign, Feature, Signal, SignalKind};

/// One step of the state machine.
///
/// `spread` is `sma_fast - sma_slow`, or `None` when either side is undefined.
pub fn transition(state: CrossSign, spread: Option<f64>) -> (SignalKind, CrossSign) {
    let next = match spread {
        Some(s) if s > 0.0 => CrossSign::Pos,
        Some(s) if s < 0.0 => CrossSign::Neg,
        _ => state,
    };
    let signal = match (state, next) {
        (CrossSign::Neg, CrossSign::Pos) => SignalKind::Buy,
        (CrossSign::Pos, CrossSign::Neg) => SignalKind::Sell,
        _ => SignalKind::Hold,
    };
    (signal, next)
}

/// Per-symbol signal engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalEngine {
    state: CrossSign,
}

impl SignalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue from the `crossover_sign` of the last stored signal.
    pub fn resume(state: CrossSign) -> Self {
        Self { state }
    }

    pub fn state(&self) -> CrossSign {
        self.state
    }

    pub fn step(&mut self, feature: &Feature) -> Signal {
        let (signal, next) = transition(self.state, feature.spread());
        self.state = next;
        Signal {
            symbol: feature.symbol.clone(),
            trade_date: feature.trade_date,
            signal,
            crossover_sign: next,
        }
    }

    pub fn run(&mut self, features: &[Feature]) -> Vec<Signal> {
        features.iter().map(|f| self.step(f)).collect()
    }
}
