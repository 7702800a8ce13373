//! Derived series: SMA features, crossover signals, next-day predictions.

pub mod features;
pub mod prediction;
pub mod signals;

pub use features::{compute_features, extend_features, FeatureError, SmaWindows};
pub use prediction::{predict, PredictionError};
pub use signals::{transition, SignalEngine};
