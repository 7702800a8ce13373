//! Pipeline configuration.
//!
//! One explicit `PipelineConfig` value is built at startup (TOML file, then
//! environment overrides, then validation) and handed to every component at
//! construction. Components never read the environment themselves.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::data::retry::RetryPolicy;
use crate::engine::features::SmaWindows;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config TOML: {0}")]
    Parse(String),

    #[error("environment variable {var}={value:?}: {reason}")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Credential that never prints.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Network settings shared by the HTTP providers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderSettings {
    pub request_timeout_secs: u64,
    /// Fixed delay before the single rate-limit retry.
    pub rate_limit_backoff_secs: u64,
    pub yahoo_base_url: String,
    pub finnhub_base_url: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            rate_limit_backoff_secs: 2,
            yahoo_base_url: "https://query2.finance.yahoo.com/v8/finance/chart".into(),
            finnhub_base_url: "https://finnhub.io/api/v1".into(),
        }
    }
}

impl ProviderSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(self.rate_limit_backoff_secs))
    }
}

/// Everything a job needs to know.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub symbols: Vec<String>,
    pub sma_fast_window: usize,
    pub sma_slow_window: usize,
    /// Trailing calendar days fetched by a backfill.
    pub backfill_days: u32,
    /// Absolute day-over-day close return above which a bar is flagged.
    pub drift_threshold: f64,
    /// Symbol → vendor identifier for the snapshot provider's crypto endpoint.
    pub crypto_vendor_map: BTreeMap<String, String>,
    /// Window for the "latest prediction per symbol" view.
    pub prediction_lookback_days: u32,
    pub store_path: PathBuf,
    /// Raw payload landing zone; archiving is off when unset.
    pub archive_dir: Option<PathBuf>,
    /// Worker threads for per-symbol parallelism; 0 means one per symbol.
    pub max_parallel_symbols: usize,
    pub provider: ProviderSettings,
    /// Only ever set from the environment.
    #[serde(skip)]
    pub finnhub_api_key: Option<Secret>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut crypto_vendor_map = BTreeMap::new();
        crypto_vendor_map.insert("BTC-USD".to_string(), "COINBASE:BTC-USD".to_string());

        Self {
            symbols: vec!["AAPL".into(), "TSLA".into(), "BTC-USD".into()],
            sma_fast_window: 10,
            sma_slow_window: 20,
            backfill_days: 730,
            drift_threshold: 0.25,
            crypto_vendor_map,
            prediction_lookback_days: 7,
            store_path: PathBuf::from("maco.db"),
            archive_dir: None,
            max_parallel_symbols: 0,
            provider: ProviderSettings::default(),
            finnhub_api_key: None,
        }
    }
}

impl PipelineConfig {
    /// Load from a TOML file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment overrides through `lookup` (usually `std::env::var`).
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(v) = lookup("SYMBOLS") {
            self.symbols = parse_symbols(&v);
        }
        if let Some(v) = lookup("SMA_FAST_WINDOW") {
            self.sma_fast_window = parse_env("SMA_FAST_WINDOW", &v)?;
        }
        if let Some(v) = lookup("SMA_SLOW_WINDOW") {
            self.sma_slow_window = parse_env("SMA_SLOW_WINDOW", &v)?;
        }
        if let Some(v) = lookup("BACKFILL_DAYS") {
            self.backfill_days = parse_env("BACKFILL_DAYS", &v)?;
        }
        if let Some(v) = lookup("DRIFT_THRESHOLD") {
            self.drift_threshold = parse_env("DRIFT_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("CRYPTO_VENDOR_MAP") {
            self.crypto_vendor_map = parse_vendor_map(&v)?;
        }
        if let Some(v) = lookup("PREDICTION_LOOKBACK_DAYS") {
            self.prediction_lookback_days = parse_env("PREDICTION_LOOKBACK_DAYS", &v)?;
        }
        if let Some(v) = lookup("MACO_STORE_PATH") {
            self.store_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("MACO_ARCHIVE_DIR") {
            self.archive_dir = (!v.trim().is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = lookup("MACO_MAX_PARALLEL") {
            self.max_parallel_symbols = parse_env("MACO_MAX_PARALLEL", &v)?;
        }
        if let Some(v) = lookup("FINNHUB_API_KEY") {
            self.finnhub_api_key = (!v.trim().is_empty()).then(|| Secret::new(v.trim()));
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return Err(ConfigError::Invalid("at least one symbol is required".into()));
        }
        if self.sma_fast_window == 0 || self.sma_slow_window == 0 {
            return Err(ConfigError::Invalid("SMA windows must be >= 1".into()));
        }
        if self.sma_fast_window >= self.sma_slow_window {
            return Err(ConfigError::Invalid(format!(
                "fast window ({}) must be shorter than slow window ({})",
                self.sma_fast_window, self.sma_slow_window
            )));
        }
        if !self.drift_threshold.is_finite() || self.drift_threshold <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "drift threshold must be a positive number, got {}",
                self.drift_threshold
            )));
        }
        if self.backfill_days == 0 {
            return Err(ConfigError::Invalid("backfill_days must be >= 1".into()));
        }
        Ok(())
    }

    pub fn windows(&self) -> Result<SmaWindows, ConfigError> {
        SmaWindows::new(self.sma_fast_window, self.sma_slow_window)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

fn parse_symbols(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_env<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// `SYM=VENDOR,SYM2=VENDOR2`
fn parse_vendor_map(value: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut map = BTreeMap::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (symbol, vendor) = entry.split_once('=').ok_or_else(|| ConfigError::InvalidEnv {
            var: "CRYPTO_VENDOR_MAP",
            value: value.to_string(),
            reason: format!("entry '{entry}' is not SYMBOL=VENDOR_ID"),
        })?;
        map.insert(symbol.trim().to_string(), vendor.trim().to_string());
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.symbols, vec!["AAPL", "TSLA", "BTC-USD"]);
        assert_eq!(cfg.sma_fast_window, 10);
        assert_eq!(cfg.sma_slow_window, 20);
        assert_eq!(cfg.backfill_days, 730);
        assert_eq!(cfg.drift_threshold, 0.25);
        assert_eq!(cfg.crypto_vendor_map["BTC-USD"], "COINBASE:BTC-USD");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = PipelineConfig::from_toml(
            r#"
            symbols = ["MSFT"]
            sma_slow_window = 50

            [provider]
            request_timeout_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.symbols, vec!["MSFT"]);
        assert_eq!(cfg.sma_fast_window, 10);
        assert_eq!(cfg.sma_slow_window, 50);
        assert_eq!(cfg.provider.request_timeout_secs, 5);
        assert_eq!(cfg.provider.rate_limit_backoff_secs, 2);
    }

    #[test]
    fn env_overrides_beat_file_values() {
        let cfg = PipelineConfig::from_toml("sma_fast_window = 5\nbackfill_days = 30")
            .unwrap()
            .with_env_overrides(env(&[
                ("SYMBOLS", "SPY, QQQ ,,ETH-USD"),
                ("SMA_FAST_WINDOW", "12"),
                ("DRIFT_THRESHOLD", "0.4"),
                ("CRYPTO_VENDOR_MAP", "ETH-USD=BINANCE:ETHUSDT"),
                ("FINNHUB_API_KEY", "abc123"),
            ]))
            .unwrap();

        assert_eq!(cfg.symbols, vec!["SPY", "QQQ", "ETH-USD"]);
        assert_eq!(cfg.sma_fast_window, 12);
        assert_eq!(cfg.backfill_days, 30);
        assert_eq!(cfg.drift_threshold, 0.4);
        assert_eq!(cfg.crypto_vendor_map.len(), 1);
        assert_eq!(cfg.crypto_vendor_map["ETH-USD"], "BINANCE:ETHUSDT");
        assert_eq!(cfg.finnhub_api_key.as_ref().unwrap().expose(), "abc123");
    }

    #[test]
    fn bad_env_number_is_reported() {
        let err = PipelineConfig::default()
            .with_env_overrides(env(&[("SMA_SLOW_WINDOW", "twenty")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "SMA_SLOW_WINDOW", .. }));
    }

    #[test]
    fn bad_vendor_map_entry_is_reported() {
        let err = PipelineConfig::default()
            .with_env_overrides(env(&[("CRYPTO_VENDOR_MAP", "BTC-USD")]))
            .unwrap_err();
        assert!(err.to_string().contains("SYMBOL=VENDOR_ID"));
    }

    #[test]
    fn validate_rejects_bad_windows() {
        let mut cfg = PipelineConfig::default();
        cfg.sma_fast_window = 0;
        assert!(cfg.validate().is_err());

        cfg.sma_fast_window = 20;
        cfg.sma_slow_window = 20;
        assert!(cfg.validate().is_err());

        cfg.sma_fast_window = 20;
        cfg.sma_slow_window = 50;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_symbols_and_bad_threshold() {
        let mut cfg = PipelineConfig::default();
        cfg.symbols.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.drift_threshold = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn secret_never_prints() {
        let cfg = PipelineConfig::default()
            .with_env_overrides(env(&[("FINNHUB_API_KEY", "hunter2")]))
            .unwrap();
        assert!(!format!("{cfg:?}").contains("hunter2"));
    }
}
