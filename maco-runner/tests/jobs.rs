use std::sync::Arc;

use chrono::NaiveDate;
use maco_core::archive::RawArchive;
use maco_core::data::provider::{date_to_epoch, FinnhubCandle, YahooRow};
use maco_core::data::{FetchOutcome, PriceProvider, ProviderError, RawBar, SyntheticProvider};
use maco_core::domain::{DateRange, ProviderName};
use maco_core::engine::SmaWindows;
use maco_core::store::{CanonicalStore, SqliteStore};
use maco_runner::{ComputeMode, JobRunner, Pipeline, Stage, SymbolOutcome};

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn symbols(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn runner_with(store: Arc<SqliteStore>, archive: Option<RawArchive>) -> JobRunner {
    let pipeline = Pipeline::new(store, archive, SmaWindows::new(3, 5).unwrap(), 0.25);
    JobRunner::new(pipeline, 0)
}

fn yahoo_row(day: NaiveDate, close: f64, low: f64) -> RawBar {
    RawBar::Yahoo(YahooRow {
        timestamp: date_to_epoch(day) + 14 * 3600 + 1800,
        open: Some(close),
        high: Some(close + 1.0),
        low: Some(low),
        close: Some(close),
        adj_close: Some(close),
        volume: Some(1_000),
    })
}

/// Bulk provider that returns one fixed bar per calendar day in the range.
struct FakeBulk;

impl PriceProvider for FakeBulk {
    fn name(&self) -> ProviderName {
        ProviderName::Yahoo
    }

    fn fetch(&self, _symbol: &str, range: DateRange) -> Result<FetchOutcome, ProviderError> {
        let mut rows = Vec::new();
        let mut day = range.start();
        while day <= range.end() {
            rows.push(yahoo_row(day, 100.0, 99.0));
            day = day.succ_opt().unwrap();
        }
        Ok(FetchOutcome::Bars(rows))
    }
}

/// Snapshot provider with data for a single day only.
struct FakeSnapshot {
    has: NaiveDate,
}

impl PriceProvider for FakeSnapshot {
    fn name(&self) -> ProviderName {
        ProviderName::Finnhub
    }

    fn fetch(&self, _symbol: &str, range: DateRange) -> Result<FetchOutcome, ProviderError> {
        if range.start() != self.has {
            return Ok(FetchOutcome::NoDataForDate(range.start()));
        }
        Ok(FetchOutcome::Bars(vec![RawBar::Finnhub(FinnhubCandle {
            timestamp: date_to_epoch(self.has),
            open: 101.0,
            high: 102.0,
            low: 100.0,
            close: 101.5,
            volume: 2_000.0,
        })]))
    }
}

/// Fails for one symbol, delegates to the synthetic walk for the rest.
struct FlakyFor(&'static str);

impl PriceProvider for FlakyFor {
    fn name(&self) -> ProviderName {
        ProviderName::Synthetic
    }

    fn fetch(&self, symbol: &str, range: DateRange) -> Result<FetchOutcome, ProviderError> {
        if symbol == self.0 {
            return Err(ProviderError::Unavailable {
                provider: ProviderName::Synthetic,
                symbol: symbol.to_string(),
                reason: "HTTP 503".into(),
            });
        }
        SyntheticProvider::with_origin(d(2024, 1, 1)).fetch(symbol, range)
    }
}

#[test]
fn snapshot_without_data_falls_back_to_bulk() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let runner = runner_with(store.clone(), None);
    let snapshot = FakeSnapshot { has: d(2024, 3, 4) };
    let day = d(2024, 3, 5);

    let summary = runner
        .run_snapshot(Some(&snapshot), &FakeBulk, &symbols(&["AAPL"]), day)
        .unwrap();

    assert!(matches!(summary.outcome("AAPL"), Some(SymbolOutcome::Completed { .. })));
    let bars = store.bars("AAPL", DateRange::single(day)).unwrap();
    assert_eq!(bars.len(), 1);
    assert_eq!(bars[0].provider, ProviderName::Yahoo);
}

#[test]
fn snapshot_with_data_keeps_snapshot_provider() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let runner = runner_with(store.clone(), None);
    let day = d(2024, 3, 4);
    let snapshot = FakeSnapshot { has: day };

    runner
        .run_snapshot(Some(&snapshot), &FakeBulk, &symbols(&["BTC-USD"]), day)
        .unwrap();

    let bars = store.bars("BTC-USD", DateRange::single(day)).unwrap();
    assert_eq!(bars[0].provider, ProviderName::Finnhub);
    assert_eq!(bars[0].close, 101.5);
    assert_eq!(bars[0].volume, 2_000);
}

#[test]
fn missing_snapshot_provider_goes_straight_to_bulk() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let runner = runner_with(store.clone(), None);
    let day = d(2024, 3, 5);

    let summary = runner
        .run_daily(None, &FakeBulk, &symbols(&["TSLA"]), day)
        .unwrap();

    match summary.outcome("TSLA") {
        Some(SymbolOutcome::Completed { counts }) => {
            assert_eq!(counts.provider, Some(ProviderName::Yahoo));
            assert_eq!(counts.merged, 1);
            assert_eq!(counts.predictions, 1);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn one_failing_symbol_leaves_others_completed() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let runner = runner_with(store.clone(), None);
    let range = DateRange::new(d(2024, 1, 1), d(2024, 2, 29)).unwrap();

    let summary = runner
        .run_backfill(&FlakyFor("TSLA"), &symbols(&["AAPL", "TSLA", "BTC-USD"]), range)
        .unwrap();

    assert!(summary.has_failures());
    assert_eq!(summary.tally(), (2, 0, 1, 0));
    match summary.outcome("TSLA") {
        Some(SymbolOutcome::Failed { stage, error }) => {
            assert_eq!(*stage, Stage::Fetch);
            assert!(error.contains("HTTP 503"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(store.count_bars("AAPL", range).unwrap() > 0);
    assert_eq!(store.count_bars("TSLA", range).unwrap(), 0);
}

#[test]
fn replayed_backfill_is_idempotent() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let runner = runner_with(store.clone(), None);
    let provider = SyntheticProvider::with_origin(d(2024, 1, 1));
    let range = DateRange::new(d(2024, 1, 1), d(2024, 3, 29)).unwrap();
    let syms = symbols(&["AAPL"]);

    runner.run_backfill(&provider, &syms, range).unwrap();
    let bars_once = store.count_bars("AAPL", range).unwrap();
    let features_once = store.features("AAPL", range).unwrap();
    let signals_once = store.signals("AAPL", range).unwrap();

    runner.run_backfill(&provider, &syms, range).unwrap();
    assert_eq!(store.count_bars("AAPL", range).unwrap(), bars_once);
    assert_eq!(store.features("AAPL", range).unwrap(), features_once);
    assert_eq!(store.signals("AAPL", range).unwrap(), signals_once);

    // Predictions are append-only: one per run for the last date.
    let last = features_once.last().unwrap().trade_date;
    let predictions = store.predictions("AAPL", last).unwrap();
    assert_eq!(predictions.len(), 2);
    assert!(predictions[0].same_projection(&predictions[1]));
}

#[test]
fn compute_after_snapshot_extends_incrementally() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let runner = runner_with(store.clone(), None);
    let provider = SyntheticProvider::with_origin(d(2024, 1, 1));
    let syms = symbols(&["AAPL"]);

    runner
        .run_backfill(&provider, &syms, DateRange::new(d(2024, 1, 1), d(2024, 1, 31)).unwrap())
        .unwrap();
    runner
        .run_snapshot(None, &provider, &syms, d(2024, 2, 1))
        .unwrap();

    let summary = runner.run_compute(&syms, ComputeMode::Incremental).unwrap();
    match summary.outcome("AAPL") {
        Some(SymbolOutcome::Completed { counts }) => {
            assert_eq!(counts.features, 1);
            assert_eq!(counts.signals, 1);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn invalid_rows_are_quarantined_not_merged() {
    struct BadLow;
    impl PriceProvider for BadLow {
        fn name(&self) -> ProviderName {
            ProviderName::Yahoo
        }
        fn fetch(&self, _symbol: &str, range: DateRange) -> Result<FetchOutcome, ProviderError> {
            // low above close
            Ok(FetchOutcome::Bars(vec![yahoo_row(range.start(), 100.0, 100.5)]))
        }
    }

    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let runner = runner_with(store.clone(), None);
    let day = d(2024, 3, 5);
    let summary = runner
        .run_snapshot(None, &BadLow, &symbols(&["AAPL"]), day)
        .unwrap();

    match summary.outcome("AAPL") {
        Some(SymbolOutcome::Completed { counts }) => {
            assert_eq!(counts.fetched, 1);
            assert_eq!(counts.rejected, 1);
            assert_eq!(counts.merged, 0);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(store.count_bars("AAPL", DateRange::single(day)).unwrap(), 0);
    assert_eq!(store.rejections("AAPL").unwrap().len(), 1);
}

#[test]
fn archive_keeps_raw_payload_per_day() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let runner = runner_with(store, Some(RawArchive::new(dir.path())));
    let day = d(2024, 3, 4);
    let snapshot = FakeSnapshot { has: day };

    runner
        .run_snapshot(Some(&snapshot), &FakeBulk, &symbols(&["AAPL"]), day)
        .unwrap();

    let archive = RawArchive::new(dir.path());
    let meta = archive.meta(ProviderName::Finnhub, "AAPL", day).unwrap();
    assert_eq!(meta.rows, 1);
    assert_eq!(archive.load(ProviderName::Finnhub, "AAPL", day).unwrap().len(), 1);
}

/// Bulk provider with a steady climb: close is 100 plus days since 2024-01-01.
struct Ramp;

impl PriceProvider for Ramp {
    fn name(&self) -> ProviderName {
        ProviderName::Yahoo
    }

    fn fetch(&self, _symbol: &str, range: DateRange) -> Result<FetchOutcome, ProviderError> {
        let mut rows = Vec::new();
        let mut day = range.start();
        while day <= range.end() {
            let close = 100.0 + (day - d(2024, 1, 1)).num_days() as f64;
            rows.push(yahoo_row(day, close, close - 1.0));
            day = day.succ_opt().unwrap();
        }
        Ok(FetchOutcome::Bars(rows))
    }
}

/// Single-day provider answering with one fixed close.
struct Restated(f64);

impl PriceProvider for Restated {
    fn name(&self) -> ProviderName {
        ProviderName::Yahoo
    }

    fn fetch(&self, _symbol: &str, range: DateRange) -> Result<FetchOutcome, ProviderError> {
        Ok(FetchOutcome::Bars(vec![yahoo_row(range.start(), self.0, self.0 - 1.0)]))
    }
}

fn assert_approx(a: Option<f64>, b: f64) {
    let a = a.unwrap();
    assert!((a - b).abs() < 1e-9, "{a} != {b}");
}

#[test]
fn restated_bar_then_incremental_compute_matches_full() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let runner = runner_with(store.clone(), None);
    let syms = symbols(&["AAPL"]);
    let day = d(2024, 1, 10);

    runner
        .run_backfill(&Ramp, &syms, DateRange::new(d(2024, 1, 1), day).unwrap())
        .unwrap();
    runner.run_snapshot(None, &Restated(120.0), &syms, day).unwrap();
    runner.run_compute(&syms, ComputeMode::Incremental).unwrap();

    let all = DateRange::everything();
    let features = store.features("AAPL", all).unwrap();
    let signals = store.signals("AAPL", all).unwrap();
    let last = features.last().unwrap();
    assert_eq!(last.trade_date, day);
    assert_approx(last.sma_fast, (107.0 + 108.0 + 120.0) / 3.0);
    assert_approx(last.sma_slow, (105.0 + 106.0 + 107.0 + 108.0 + 120.0) / 5.0);

    runner.run_compute(&syms, ComputeMode::Full).unwrap();
    assert_eq!(store.features("AAPL", all).unwrap(), features);
    assert_eq!(store.signals("AAPL", all).unwrap(), signals);

    // backfill, incremental, full: the last two agree, the first is stale.
    let predictions = store.predictions("AAPL", day).unwrap();
    assert_eq!(predictions.len(), 3);
    assert!(predictions[1].same_projection(&predictions[2]));
    assert!(!predictions[0].same_projection(&predictions[1]));
}

#[test]
fn replayed_daily_with_fallback_close_refreshes_derived_rows() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let runner = runner_with(store.clone(), None);
    let syms = symbols(&["AAPL"]);
    let day = d(2024, 1, 10);

    runner
        .run_backfill(&Ramp, &syms, DateRange::new(d(2024, 1, 1), d(2024, 1, 9)).unwrap())
        .unwrap();
    let snapshot = FakeSnapshot { has: day };
    runner.run_daily(Some(&snapshot), &Ramp, &syms, day).unwrap();
    assert_eq!(store.bars("AAPL", DateRange::single(day)).unwrap()[0].close, 101.5);

    // Replay: the snapshot provider has nothing now, so the bulk close wins.
    runner.run_daily(None, &Ramp, &syms, day).unwrap();
    let bar = store.bars("AAPL", DateRange::single(day)).unwrap().remove(0);
    assert_eq!(bar.provider, ProviderName::Yahoo);
    assert_eq!(bar.close, 109.0);

    let all = DateRange::everything();
    let features = store.features("AAPL", all).unwrap();
    let signals = store.signals("AAPL", all).unwrap();
    assert_approx(features.last().unwrap().sma_fast, 108.0);

    runner.run_compute(&syms, ComputeMode::Full).unwrap();
    assert_eq!(store.features("AAPL", all).unwrap(), features);
    assert_eq!(store.signals("AAPL", all).unwrap(), signals);
}

#[test]
fn compute_without_new_bars_leaves_history_alone() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let runner = runner_with(store.clone(), None);
    let syms = symbols(&["AAPL"]);
    runner
        .run_backfill(&Ramp, &syms, DateRange::new(d(2024, 1, 1), d(2024, 1, 10)).unwrap())
        .unwrap();

    let summary = runner.run_compute(&syms, ComputeMode::Incremental).unwrap();
    match summary.outcome("AAPL") {
        Some(SymbolOutcome::Completed { counts }) => {
            assert_eq!(counts.features, 0);
            assert_eq!(counts.predictions, 1);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}
