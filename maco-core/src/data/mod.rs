pub mod finnhub;
pub(crate) mod http;
pub mod normalize;
pub mod provider;
pub mod retry;
pub mod synthetic;
pub mod yahoo;

pub use finnhub::FinnhubProvider;
pub use normalize::{normalize, normalize_batch, NormalizedBatch, ValidationFailure};
pub use provider::{FetchOutcome, PriceProvider, ProviderError, RawBar};
pub use synthetic::SyntheticProvider;
pub use yahoo::YahooProvider;
