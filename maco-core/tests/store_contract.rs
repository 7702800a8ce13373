//! Canonical store contract: idempotence, uniqueness, quarantine, and
//! prediction regeneration, exercised through the public API.

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use std::sync::Arc;
use std::thread;

use maco_core::data::normalize_batch;
use maco_core::data::provider::{date_to_epoch, RawBar, YahooRow};
use maco_core::domain::{CrossSign, DateRange, PriceBar, ProviderName};
use maco_core::engine::{compute_features, predict, SignalEngine, SmaWindows};
use maco_core::store::{CanonicalStore, SqliteStore};

// ── Helpers ──────────────────────────────────────────────────────────

fn day(n: i64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::days(n)
}

fn bar(symbol: &str, n: i64, close: f64) -> PriceBar {
    PriceBar {
        symbol: symbol.into(),
        trade_date: day(n),
        open: close,
        high: close + 1.0,
        low: close - 1.0,
        close,
        adj_close: Some(close),
        volume: 5_000,
        provider: ProviderName::Yahoo,
        ingest_ts: Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap(),
    }
}

fn yahoo(n: i64, open: f64, high: f64, low: f64, close: f64) -> RawBar {
    RawBar::Yahoo(YahooRow {
        timestamp: date_to_epoch(day(n)) + 14 * 3600,
        open: Some(open),
        high: Some(high),
        low: Some(low),
        close: Some(close),
        adj_close: Some(close),
        volume: Some(100),
    })
}

// ── Idempotence ──────────────────────────────────────────────────────

#[test]
fn repeated_upsert_leaves_one_row_equal_to_input() {
    let store = SqliteStore::open_in_memory().unwrap();
    let b = bar("AAPL", 0, 185.0);

    let before = Utc::now();
    for _ in 0..3 {
        store.upsert_bars(std::slice::from_ref(&b)).unwrap();
    }

    let rows = store.bars("AAPL", DateRange::everything()).unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].same_content(&b));
    assert!(rows[0].ingest_ts >= before - Duration::seconds(1));
}

#[test]
fn overlapping_batches_converge() {
    let store = SqliteStore::open_in_memory().unwrap();
    let first: Vec<_> = (0..10).map(|i| bar("AAPL", i, 100.0 + i as f64)).collect();
    let second: Vec<_> = (5..15).map(|i| bar("AAPL", i, 100.0 + i as f64)).collect();

    store.upsert_bars(&first).unwrap();
    store.upsert_bars(&second).unwrap();
    store.upsert_bars(&first).unwrap();

    let rows = store.bars("AAPL", DateRange::everything()).unwrap();
    assert_eq!(rows.len(), 15);
    let dates: Vec<_> = rows.iter().map(|b| b.trade_date).collect();
    let mut sorted = dates.clone();
    sorted.dedup();
    assert_eq!(dates, sorted);
}

// ── Uniqueness under concurrent writers ──────────────────────────────

#[test]
fn concurrent_writers_never_duplicate_a_key() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());

    let handles: Vec<_> = (0..4)
        .map(|w| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let batch: Vec<_> = (0..20).map(|i| bar("BTC-USD", i, 40_000.0 + w as f64)).collect();
                store.upsert_bars(&batch).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let rows = store.bars("BTC-USD", DateRange::everything()).unwrap();
    assert_eq!(rows.len(), 20);
    // Every row comes whole from one writer's batch.
    for row in &rows {
        assert_eq!(row.high, row.close + 1.0);
        assert_eq!(row.adj_close, Some(row.close));
    }
}

// ── Quarantine ───────────────────────────────────────────────────────

#[test]
fn low_above_close_reaches_rejected_log_not_store() {
    let store = SqliteStore::open_in_memory().unwrap();
    let raws = vec![
        yahoo(0, 10.0, 11.0, 9.0, 10.5),
        yahoo(1, 10.5, 11.0, 10.8, 10.6),
        yahoo(2, 10.6, 11.2, 10.1, 11.0),
    ];

    let batch = normalize_batch(&raws, "TSLA", None, 0.25, Utc::now());
    store.upsert_bars(&batch.accepted).unwrap();
    store.record_rejections(&batch.rejected).unwrap();

    let stored = store.bars("TSLA", DateRange::everything()).unwrap();
    assert_eq!(stored.iter().map(|b| b.trade_date).collect::<Vec<_>>(), vec![day(0), day(2)]);

    let rejected = store.rejections("TSLA").unwrap();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].trade_date, Some(day(1)));
    assert_eq!(rejected[0].payload["low"], 10.8);
}

// ── Prediction regeneration ──────────────────────────────────────────

#[test]
fn regenerated_prediction_wins_in_joined_view() {
    let store = SqliteStore::open_in_memory().unwrap();
    let bars: Vec<_> = (0..6).map(|i| bar("SPY", i, 400.0 + (i % 3) as f64)).collect();
    store.upsert_bars(&bars).unwrap();

    let features = compute_features(&bars, SmaWindows::new(2, 3).unwrap()).unwrap();
    let signals = SignalEngine::new().run(&features);
    store.upsert_features(&features).unwrap();
    store.upsert_signals(&signals).unwrap();

    let state = signals.last().map_or(CrossSign::Undefined, |s| s.crossover_sign);
    let t1 = Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap();
    let t2 = t1 + Duration::minutes(5);
    for at in [t1, t2] {
        let p = predict(&features[5], Some(&features[4]), &bars[4..], state, at).unwrap();
        store.append_predictions(&[p]).unwrap();
    }

    let history = store.predictions("SPY", day(5)).unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].same_projection(&history[1]));

    let joined = store.joined("SPY", DateRange::single(day(5))).unwrap();
    assert_eq!(joined[0].generated_at, Some(t2));
    assert_eq!(joined[0].sma_fast, features[5].sma_fast);

    let latest = store.latest_predictions(day(5), 7).unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].generated_at, t2);
}
