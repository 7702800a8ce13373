pub mod audit;
pub mod bar;
pub mod feature;
pub mod prediction;
pub mod range;
pub mod signal;

pub use audit::{DriftFlag, RejectedBar};
pub use bar::{PriceBar, ProviderName};
pub use feature::Feature;
pub use prediction::{Direction, Prediction};
pub use range::DateRange;
pub use signal::{CrossSign, Signal, SignalKind};
