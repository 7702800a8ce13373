//! Per-symbol pipeline: fetch → normalize → merge → feature → signal → predict.
//!
//! Each stage commits its writes before the next one starts. Errors carry
//! the stage they came from so the job summary can say where a symbol died.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use maco_core::archive::{ArchiveError, RawArchive};
use maco_core::data::{normalize_batch, FetchOutcome, PriceProvider, ProviderError, RawBar};
use maco_core::domain::{CrossSign, DateRange, Feature, ProviderName};
use maco_core::engine::{
    compute_features, extend_features, predict, FeatureError, PredictionError, SignalEngine,
    SmaWindows,
};
use maco_core::store::{CanonicalStore, DeriveBacklog, StoreError};

use crate::summary::{Stage, StageCounts};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Feature(#[from] FeatureError),

    #[error(transparent)]
    Prediction(#[from] PredictionError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// A pipeline error tagged with the stage that raised it.
#[derive(Debug, Error)]
#[error("{stage} stage failed: {source}")]
pub struct StageFailure {
    pub stage: Stage,
    #[source]
    pub source: PipelineError,
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, StageFailure>;
}

impl<T, E: Into<PipelineError>> AtStage<T> for Result<T, E> {
    fn at(self, stage: Stage) -> Result<T, StageFailure> {
        self.map_err(|e| StageFailure {
            stage,
            source: e.into(),
        })
    }
}

/// How derived series are brought up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeMode {
    /// Recompute every feature and signal from the full bar history.
    Full,
    /// Rebuild from the earliest bar written since the last derive; falls
    /// back to `Full` when the stored features no longer line up with the bars.
    Incremental,
}

/// Result of a fetch, before normalization.
#[derive(Debug)]
pub enum Fetched {
    Bars {
        provider: ProviderName,
        raws: Vec<RawBar>,
    },
    NoData(NaiveDate),
}

/// Shared, read-only context for every symbol of a job.
pub struct Pipeline {
    store: Arc<dyn CanonicalStore>,
    archive: Option<RawArchive>,
    windows: SmaWindows,
    drift_threshold: f64,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn CanonicalStore>,
        archive: Option<RawArchive>,
        windows: SmaWindows,
        drift_threshold: f64,
    ) -> Self {
        Self {
            store,
            archive,
            windows,
            drift_threshold,
        }
    }

    pub fn store(&self) -> &dyn CanonicalStore {
        self.store.as_ref()
    }

    /// Fetch `range` from `provider`.
    pub fn fetch(
        &self,
        provider: &dyn PriceProvider,
        symbol: &str,
        range: DateRange,
    ) -> Result<Fetched, StageFailure> {
        match provider.fetch(symbol, range).at(Stage::Fetch)? {
            FetchOutcome::Bars(raws) => Ok(Fetched::Bars {
                provider: provider.name(),
                raws,
            }),
            FetchOutcome::NoDataForDate(day) => Ok(Fetched::NoData(day)),
        }
    }

    /// Snapshot fetch for one day with fallback to the bulk provider.
    ///
    /// The fallback is used when the snapshot provider has no data for the
    /// day or is not configured at all.
    pub fn fetch_day_with_fallback(
        &self,
        snapshot: Option<&dyn PriceProvider>,
        fallback: &dyn PriceProvider,
        symbol: &str,
        day: NaiveDate,
    ) -> Result<Fetched, StageFailure> {
        let range = DateRange::single(day);
        if let Some(primary) = snapshot {
            match self.fetch(primary, symbol, range)? {
                bars @ Fetched::Bars { .. } => return Ok(bars),
                Fetched::NoData(_) => {
                    warn!(symbol, %day, provider = %primary.name(), fallback = %fallback.name(),
                        "no snapshot data, falling back");
                }
            }
        }
        self.fetch(fallback, symbol, range)
    }

    /// Archive, normalize, and merge fetched rows.
    pub fn ingest(
        &self,
        symbol: &str,
        provider: ProviderName,
        raws: &[RawBar],
        range: DateRange,
        counts: &mut StageCounts,
    ) -> Result<(), StageFailure> {
        let now = Utc::now();
        counts.provider = Some(provider);
        counts.fetched = raws.len();

        if let Some(archive) = &self.archive {
            archive
                .write(provider, symbol, raws, range.end(), now)
                .at(Stage::Fetch)?;
        }

        let prior_close = self
            .store
            .latest_bar_before(symbol, range.start())
            .at(Stage::Normalize)?
            .map(|b| b.close);
        let batch = normalize_batch(raws, symbol, prior_close, self.drift_threshold, now);
        counts.accepted = batch.accepted.len();
        counts.rejected = batch.rejected.len();
        counts.drift_flagged = batch.drift.len();
        info!(symbol, stage = "normalize", accepted = counts.accepted, rejected = counts.rejected,
            drift = counts.drift_flagged, "stage complete");

        self.store.record_rejections(&batch.rejected).at(Stage::Merge)?;
        self.store.record_drift(&batch.drift).at(Stage::Merge)?;
        counts.merged = self.store.upsert_bars(&batch.accepted).at(Stage::Merge)?;
        info!(symbol, stage = "merge", rows = counts.merged, "stage complete");
        Ok(())
    }

    /// Bring features and signals up to date and append a fresh prediction.
    pub fn derive(
        &self,
        symbol: &str,
        mode: ComputeMode,
        generated_at: DateTime<Utc>,
        counts: &mut StageCounts,
    ) -> Result<(), StageFailure> {
        let backlog = self.store.derive_backlog(symbol).at(Stage::Feature)?;
        let (recent, state) = match mode {
            ComputeMode::Full => self.derive_full(symbol, counts)?,
            ComputeMode::Incremental => {
                match self.derive_incremental(symbol, backlog.as_ref(), counts)? {
                    Some(done) => done,
                    None => {
                        info!(symbol, "stored features out of line with bars, recomputing in full");
                        self.derive_full(symbol, counts)?
                    }
                }
            }
        };
        if let Some(backlog) = &backlog {
            if !self.store.clear_derive_backlog(backlog).at(Stage::Signal)? {
                debug!(symbol, "bars written during derive, backlog kept for the next run");
            }
        }

        let Some(latest) = recent.last() else {
            return Ok(());
        };
        let previous = recent.len().checked_sub(2).map(|i| &recent[i]);
        let bars = self
            .store
            .tail_bars(symbol, latest.trade_date, 2)
            .at(Stage::Predict)?;
        let prediction = predict(latest, previous, &bars, state, generated_at).at(Stage::Predict)?;
        counts.predictions = self
            .store
            .append_predictions(std::slice::from_ref(&prediction))
            .at(Stage::Predict)?;
        info!(symbol, stage = "predict", trade_date = %prediction.trade_date,
            signal = %prediction.predicted_signal, close = prediction.predicted_close, "stage complete");
        Ok(())
    }

    /// Returns the last two features and the sign state after the last one.
    fn derive_full(
        &self,
        symbol: &str,
        counts: &mut StageCounts,
    ) -> Result<(Vec<Feature>, CrossSign), StageFailure> {
        let bars = self
            .store
            .bars(symbol, DateRange::everything())
            .at(Stage::Feature)?;
        let features = compute_features(&bars, self.windows).at(Stage::Feature)?;
        counts.features = self.store.upsert_features(&features).at(Stage::Feature)?;
        info!(symbol, stage = "feature", mode = "full", rows = counts.features, "stage complete");

        let mut engine = SignalEngine::new();
        let signals = engine.run(&features);
        counts.signals = self.store.upsert_signals(&signals).at(Stage::Signal)?;
        info!(symbol, stage = "signal", rows = counts.signals, "stage complete");

        let recent = features[features.len().saturating_sub(2)..].to_vec();
        Ok((recent, engine.state()))
    }

    /// Recompute from the earliest bar written since the last derive.
    ///
    /// Stored features before that date are kept; everything from it on is
    /// rebuilt, so a restated bar refreshes its own and later rows. `None`
    /// when the stored history cannot be extended safely.
    fn derive_incremental(
        &self,
        symbol: &str,
        backlog: Option<&DeriveBacklog>,
        counts: &mut StageCounts,
    ) -> Result<Option<(Vec<Feature>, CrossSign)>, StageFailure> {
        let mut prior = self
            .store
            .features(symbol, DateRange::everything())
            .at(Stage::Feature)?;
        if let Some(backlog) = backlog {
            let keep = prior.partition_point(|f| f.trade_date < backlog.from_date);
            prior.truncate(keep);
        }
        let Some(last) = prior.last() else {
            return Ok(None);
        };
        let last_date = last.trade_date;

        let history = DateRange::new(DateRange::everything().start(), last_date)
            .unwrap_or_else(|| DateRange::single(last_date));
        if self.store.count_bars(symbol, history).at(Stage::Feature)? != prior.len() {
            return Ok(None);
        }

        let tail_len = self.windows.warmup().min(prior.len());
        let tail = self
            .store
            .tail_bars(symbol, last_date, tail_len)
            .at(Stage::Feature)?;
        let tail_dates = tail.iter().map(|b| b.trade_date);
        if !tail_dates.eq(prior[prior.len() - tail_len..].iter().map(|f| f.trade_date)) {
            return Ok(None);
        }

        let stored_state = self
            .store
            .signals(symbol, DateRange::single(last_date))
            .at(Stage::Signal)?
            .first()
            .map(|s| s.crossover_sign);
        let Some(state) = stored_state else {
            return Ok(None);
        };

        let new_bars = match DateRange::new(last_date + Duration::days(1), DateRange::everything().end()) {
            Some(range) => self.store.bars(symbol, range).at(Stage::Feature)?,
            None => Vec::new(),
        };
        let new_features = extend_features(&prior, &tail, &new_bars, self.windows).at(Stage::Feature)?;
        counts.features = self.store.upsert_features(&new_features).at(Stage::Feature)?;
        info!(symbol, stage = "feature", mode = "incremental", rows = counts.features, "stage complete");

        let mut engine = SignalEngine::resume(state);
        let signals = engine.run(&new_features);
        counts.signals = self.store.upsert_signals(&signals).at(Stage::Signal)?;
        info!(symbol, stage = "signal", rows = counts.signals, "stage complete");

        let mut recent = prior[prior.len().saturating_sub(2)..].to_vec();
        recent.extend(new_features);
        let recent = recent[recent.len().saturating_sub(2)..].to_vec();
        Ok(Some((recent, engine.state())))
    }
}
