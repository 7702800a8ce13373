//! SQLite-backed canonical store.
//!
//! Dates are stored as `YYYY-MM-DD` text and timestamps as UTC epoch
//! microseconds. Each batch is one transaction and each key one
//! `INSERT … ON CONFLICT DO UPDATE`, so a key is never observed half-written.
//! Other processes are serialized by SQLite's file lock and a busy timeout.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Statement};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info};

use super::{CanonicalStore, DeriveBacklog, JoinedRow, StoreError};
use crate::domain::{DateRange, DriftFlag, Feature, PriceBar, Prediction, RejectedBar, Signal};

const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS price_bars (
    symbol     TEXT    NOT NULL,
    trade_date TEXT    NOT NULL,
    open       REAL    NOT NULL,
    high       REAL    NOT NULL,
    low        REAL    NOT NULL,
    close      REAL    NOT NULL,
    adj_close  REAL,
    volume     INTEGER NOT NULL,
    provider   TEXT    NOT NULL,
    ingest_ts  INTEGER NOT NULL,
    PRIMARY KEY (symbol, trade_date)
);

CREATE TABLE IF NOT EXISTS features (
    symbol     TEXT NOT NULL,
    trade_date TEXT NOT NULL,
    sma_fast   REAL,
    sma_slow   REAL,
    PRIMARY KEY (symbol, trade_date)
);

CREATE TABLE IF NOT EXISTS signals (
    symbol         TEXT NOT NULL,
    trade_date     TEXT NOT NULL,
    signal         TEXT NOT NULL,
    crossover_sign TEXT NOT NULL,
    PRIMARY KEY (symbol, trade_date)
);

CREATE TABLE IF NOT EXISTS predictions (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol              TEXT    NOT NULL,
    trade_date          TEXT    NOT NULL,
    predicted_signal    TEXT    NOT NULL,
    predicted_direction TEXT    NOT NULL,
    predicted_close     REAL    NOT NULL,
    generated_at        INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_predictions_key
    ON predictions(symbol, trade_date, generated_at DESC);

CREATE TABLE IF NOT EXISTS rejected_bars (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol      TEXT    NOT NULL,
    provider    TEXT    NOT NULL,
    trade_date  TEXT,
    reason      TEXT    NOT NULL,
    payload     TEXT    NOT NULL,
    rejected_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rejected_symbol ON rejected_bars(symbol);

CREATE TABLE IF NOT EXISTS drift_flags (
    symbol     TEXT    NOT NULL,
    trade_date TEXT    NOT NULL,
    provider   TEXT    NOT NULL,
    prev_close REAL    NOT NULL,
    close      REAL    NOT NULL,
    day_return REAL    NOT NULL,
    threshold  REAL    NOT NULL,
    flagged_at INTEGER NOT NULL,
    PRIMARY KEY (symbol, trade_date)
);

CREATE TABLE IF NOT EXISTS derive_backlog (
    symbol    TEXT    NOT NULL PRIMARY KEY,
    from_date TEXT    NOT NULL,
    revision  INTEGER NOT NULL
);

CREATE TRIGGER IF NOT EXISTS price_bars_backlog_insert AFTER INSERT ON price_bars
BEGIN
    INSERT OR IGNORE INTO derive_backlog (symbol, from_date, revision)
        VALUES (NEW.symbol, NEW.trade_date, 0);
    UPDATE derive_backlog
        SET from_date = min(from_date, NEW.trade_date), revision = revision + 1
        WHERE symbol = NEW.symbol;
END;

CREATE TRIGGER IF NOT EXISTS price_bars_backlog_update AFTER UPDATE ON price_bars
BEGIN
    INSERT OR IGNORE INTO derive_backlog (symbol, from_date, revision)
        VALUES (NEW.symbol, NEW.trade_date, 0);
    UPDATE derive_backlog
        SET from_date = min(from_date, NEW.trade_date), revision = revision + 1
        WHERE symbol = NEW.symbol;
END;
";

const BAR_COLUMNS: &str =
    "symbol, trade_date, open, high, low, close, adj_close, volume, provider, ingest_ts";

const PREDICTION_COLUMNS: &str =
    "symbol, trade_date, predicted_signal, predicted_direction, predicted_close, generated_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a store file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!(path = %path.as_ref().display(), "canonical store opened");
        Ok(store)
    }

    /// Private in-memory store, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        debug!("in-memory canonical store opened");
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.lock()?.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Run one keyed upsert per item inside a single transaction. Any
    /// statement that does not affect exactly one row rolls the batch back.
    fn write_keyed<T>(
        &self,
        table: &'static str,
        sql: &str,
        items: &[T],
        key: impl Fn(&T) -> (String, NaiveDate),
        bind: impl Fn(&mut Statement<'_>, &T) -> rusqlite::Result<usize>,
    ) -> Result<usize, StoreError> {
        if items.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(sql)?;
            for item in items {
                let rows = bind(&mut *stmt, item)?;
                if rows != 1 {
                    let (symbol, trade_date) = key(item);
                    error!(table, symbol, %trade_date, rows, "merge conflict, batch rolled back");
                    return Err(StoreError::MergeConflict {
                        table,
                        symbol,
                        trade_date,
                        rows,
                    });
                }
            }
        }
        tx.commit()?;
        debug!(table, rows = items.len(), "batch committed");
        Ok(items.len())
    }

    fn append<T>(
        &self,
        sql: &str,
        items: &[T],
        bind: impl Fn(&mut Statement<'_>, &T) -> Result<usize, StoreError>,
    ) -> Result<usize, StoreError> {
        if items.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare_cached(sql)?;
            for item in items {
                written += bind(&mut *stmt, item)?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    fn query_rows<T>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, map)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

// ── Column codecs ──

fn micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn conversion_error(idx: usize, ty: Type, reason: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, reason.into())
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e: T::Err| conversion_error(idx, Type::Text, format!("'{text}': {e}")))
}

fn parse_opt_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(text) => text
            .parse()
            .map(Some)
            .map_err(|e: T::Err| conversion_error(idx, Type::Text, format!("'{text}': {e}"))),
    }
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: i64 = row.get(idx)?;
    DateTime::from_timestamp_micros(value)
        .ok_or_else(|| conversion_error(idx, Type::Integer, format!("timestamp {value} out of range")))
}

fn ts_opt_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        None => Ok(None),
        Some(_) => ts_col(row, idx).map(Some),
    }
}

fn bar_from_row(row: &Row<'_>) -> rusqlite::Result<PriceBar> {
    Ok(PriceBar {
        symbol: row.get(0)?,
        trade_date: parse_col(row, 1)?,
        open: row.get(2)?,
        high: row.get(3)?,
        low: row.get(4)?,
        close: row.get(5)?,
        adj_close: row.get(6)?,
        volume: row.get(7)?,
        provider: parse_col(row, 8)?,
        ingest_ts: ts_col(row, 9)?,
    })
}

fn prediction_from_row(row: &Row<'_>) -> rusqlite::Result<Prediction> {
    Ok(Prediction {
        symbol: row.get(0)?,
        trade_date: parse_col(row, 1)?,
        predicted_signal: parse_col(row, 2)?,
        predicted_direction: parse_col(row, 3)?,
        predicted_close: row.get(4)?,
        generated_at: ts_col(row, 5)?,
    })
}

impl CanonicalStore for SqliteStore {
    fn upsert_bars(&self, bars: &[PriceBar]) -> Result<usize, StoreError> {
        let now = micros(Utc::now());
        self.write_keyed(
            "price_bars",
            "INSERT INTO price_bars
                (symbol, trade_date, open, high, low, close, adj_close, volume, provider, ingest_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(symbol, trade_date) DO UPDATE SET
                open      = excluded.open,
                high      = excluded.high,
                low       = excluded.low,
                close     = excluded.close,
                adj_close = excluded.adj_close,
                volume    = excluded.volume,
                provider  = excluded.provider,
                ingest_ts = excluded.ingest_ts",
            bars,
            |b| (b.symbol.clone(), b.trade_date),
            |stmt, b| {
                stmt.execute(params![
                    b.symbol,
                    b.trade_date.to_string(),
                    b.open,
                    b.high,
                    b.low,
                    b.close,
                    b.adj_close,
                    b.volume,
                    b.provider.as_str(),
                    now,
                ])
            },
        )
    }

    fn bars(&self, symbol: &str, range: DateRange) -> Result<Vec<PriceBar>, StoreError> {
        self.query_rows(
            &format!(
                "SELECT {BAR_COLUMNS} FROM price_bars
                 WHERE symbol = ?1 AND trade_date BETWEEN ?2 AND ?3
                 ORDER BY trade_date"
            ),
            params![symbol, range.start().to_string(), range.end().to_string()],
            bar_from_row,
        )
    }

    fn count_bars(&self, symbol: &str, range: DateRange) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM price_bars
             WHERE symbol = ?1 AND trade_date BETWEEN ?2 AND ?3",
            params![symbol, range.start().to_string(), range.end().to_string()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn latest_bar_before(
        &self,
        symbol: &str,
        date: NaiveDate,
    ) -> Result<Option<PriceBar>, StoreError> {
        let conn = self.lock()?;
        let bar = conn
            .query_row(
                &format!(
                    "SELECT {BAR_COLUMNS} FROM price_bars
                     WHERE symbol = ?1 AND trade_date < ?2
                     ORDER BY trade_date DESC LIMIT 1"
                ),
                params![symbol, date.to_string()],
                bar_from_row,
            )
            .optional()?;
        Ok(bar)
    }

    fn tail_bars(
        &self,
        symbol: &str,
        date: NaiveDate,
        n: usize,
    ) -> Result<Vec<PriceBar>, StoreError> {
        let mut bars = self.query_rows(
            &format!(
                "SELECT {BAR_COLUMNS} FROM price_bars
                 WHERE symbol = ?1 AND trade_date <= ?2
                 ORDER BY trade_date DESC LIMIT ?3"
            ),
            params![symbol, date.to_string(), n as i64],
            bar_from_row,
        )?;
        bars.reverse();
        Ok(bars)
    }

    fn derive_backlog(&self, symbol: &str) -> Result<Option<DeriveBacklog>, StoreError> {
        let conn = self.lock()?;
        let backlog = conn
            .query_row(
                "SELECT symbol, from_date, revision FROM derive_backlog WHERE symbol = ?1",
                params![symbol],
                |row| {
                    Ok(DeriveBacklog {
                        symbol: row.get(0)?,
                        from_date: parse_col(row, 1)?,
                        revision: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(backlog)
    }

    fn clear_derive_backlog(&self, backlog: &DeriveBacklog) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "DELETE FROM derive_backlog WHERE symbol = ?1 AND revision = ?2",
            params![backlog.symbol, backlog.revision],
        )?;
        Ok(rows == 1)
    }

    fn upsert_features(&self, features: &[Feature]) -> Result<usize, StoreError> {
        self.write_keyed(
            "features",
            "INSERT INTO features (symbol, trade_date, sma_fast, sma_slow)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(symbol, trade_date) DO UPDATE SET
                sma_fast = excluded.sma_fast,
                sma_slow = excluded.sma_slow",
            features,
            |f| (f.symbol.clone(), f.trade_date),
            |stmt, f| {
                stmt.execute(params![
                    f.symbol,
                    f.trade_date.to_string(),
                    f.sma_fast,
                    f.sma_slow
                ])
            },
        )
    }

    fn features(&self, symbol: &str, range: DateRange) -> Result<Vec<Feature>, StoreError> {
        self.query_rows(
            "SELECT symbol, trade_date, sma_fast, sma_slow FROM features
             WHERE symbol = ?1 AND trade_date BETWEEN ?2 AND ?3
             ORDER BY trade_date",
            params![symbol, range.start().to_string(), range.end().to_string()],
            |row| {
                Ok(Feature {
                    symbol: row.get(0)?,
                    trade_date: parse_col(row, 1)?,
                    sma_fast: row.get(2)?,
                    sma_slow: row.get(3)?,
                })
            },
        )
    }

    fn upsert_signals(&self, signals: &[Signal]) -> Result<usize, StoreError> {
        self.write_keyed(
            "signals",
            "INSERT INTO signals (symbol, trade_date, signal, crossover_sign)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(symbol, trade_date) DO UPDATE SET
                signal         = excluded.signal,
                crossover_sign = excluded.crossover_sign",
            signals,
            |s| (s.symbol.clone(), s.trade_date),
            |stmt, s| {
                stmt.execute(params![
                    s.symbol,
                    s.trade_date.to_string(),
                    s.signal.as_str(),
                    s.crossover_sign.as_str()
                ])
            },
        )
    }

    fn signals(&self, symbol: &str, range: DateRange) -> Result<Vec<Signal>, StoreError> {
        self.query_rows(
            "SELECT symbol, trade_date, signal, crossover_sign FROM signals
             WHERE symbol = ?1 AND trade_date BETWEEN ?2 AND ?3
             ORDER BY trade_date",
            params![symbol, range.start().to_string(), range.end().to_string()],
            |row| {
                Ok(Signal {
                    symbol: row.get(0)?,
                    trade_date: parse_col(row, 1)?,
                    signal: parse_col(row, 2)?,
                    crossover_sign: parse_col(row, 3)?,
                })
            },
        )
    }

    fn append_predictions(&self, predictions: &[Prediction]) -> Result<usize, StoreError> {
        self.append(
            &format!("INSERT INTO predictions ({PREDICTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
            predictions,
            |stmt, p| {
                Ok(stmt.execute(params![
                    p.symbol,
                    p.trade_date.to_string(),
                    p.predicted_signal.as_str(),
                    p.predicted_direction.as_str(),
                    p.predicted_close,
                    micros(p.generated_at),
                ])?)
            },
        )
    }

    fn predictions(
        &self,
        symbol: &str,
        trade_date: NaiveDate,
    ) -> Result<Vec<Prediction>, StoreError> {
        self.query_rows(
            &format!(
                "SELECT {PREDICTION_COLUMNS} FROM predictions
                 WHERE symbol = ?1 AND trade_date = ?2
                 ORDER BY generated_at, id"
            ),
            params![symbol, trade_date.to_string()],
            prediction_from_row,
        )
    }

    fn joined(&self, symbol: &str, range: DateRange) -> Result<Vec<JoinedRow>, StoreError> {
        self.query_rows(
            "SELECT b.symbol, b.trade_date, b.open, b.high, b.low, b.close, b.adj_close,
                    b.volume, b.provider,
                    f.sma_fast, f.sma_slow,
                    s.signal, s.crossover_sign,
                    p.predicted_signal, p.predicted_direction, p.predicted_close, p.generated_at
             FROM price_bars b
             LEFT JOIN features f ON f.symbol = b.symbol AND f.trade_date = b.trade_date
             LEFT JOIN signals s ON s.symbol = b.symbol AND s.trade_date = b.trade_date
             LEFT JOIN predictions p ON p.id = (
                 SELECT q.id FROM predictions q
                 WHERE q.symbol = b.symbol AND q.trade_date = b.trade_date
                 ORDER BY q.generated_at DESC, q.id DESC
                 LIMIT 1)
             WHERE b.symbol = ?1 AND b.trade_date BETWEEN ?2 AND ?3
             ORDER BY b.trade_date",
            params![symbol, range.start().to_string(), range.end().to_string()],
            |row| {
                Ok(JoinedRow {
                    symbol: row.get(0)?,
                    trade_date: parse_col(row, 1)?,
                    open: row.get(2)?,
                    high: row.get(3)?,
                    low: row.get(4)?,
                    close: row.get(5)?,
                    adj_close: row.get(6)?,
                    volume: row.get(7)?,
                    provider: parse_col(row, 8)?,
                    sma_fast: row.get(9)?,
                    sma_slow: row.get(10)?,
                    signal: parse_opt_col(row, 11)?,
                    crossover_sign: parse_opt_col(row, 12)?,
                    predicted_signal: parse_opt_col(row, 13)?,
                    predicted_direction: parse_opt_col(row, 14)?,
                    predicted_close: row.get(15)?,
                    generated_at: ts_opt_col(row, 16)?,
                })
            },
        )
    }

    fn latest_predictions(
        &self,
        as_of: NaiveDate,
        lookback_days: u32,
    ) -> Result<Vec<Prediction>, StoreError> {
        let start = as_of - Duration::days(i64::from(lookback_days));
        self.query_rows(
            &format!(
                "SELECT {PREDICTION_COLUMNS} FROM predictions
                 WHERE id IN (
                     SELECT (SELECT q.id FROM predictions q
                             WHERE q.symbol = s.symbol AND q.trade_date BETWEEN ?1 AND ?2
                             ORDER BY q.generated_at DESC, q.id DESC
                             LIMIT 1)
                     FROM (SELECT DISTINCT symbol FROM predictions
                           WHERE trade_date BETWEEN ?1 AND ?2) s)
                 ORDER BY symbol"
            ),
            params![start.to_string(), as_of.to_string()],
            prediction_from_row,
        )
    }

    fn record_rejections(&self, rejected: &[RejectedBar]) -> Result<usize, StoreError> {
        self.append(
            "INSERT INTO rejected_bars (symbol, provider, trade_date, reason, payload, rejected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rejected,
            |stmt, r| {
                let payload = serde_json::to_string(&r.payload)?;
                Ok(stmt.execute(params![
                    r.symbol,
                    r.provider.as_str(),
                    r.trade_date.map(|d| d.to_string()),
                    r.reason,
                    payload,
                    micros(r.rejected_at),
                ])?)
            },
        )
    }

    fn rejections(&self, symbol: &str) -> Result<Vec<RejectedBar>, StoreError> {
        self.query_rows(
            "SELECT symbol, provider, trade_date, reason, payload, rejected_at
             FROM rejected_bars WHERE symbol = ?1 ORDER BY id",
            params![symbol],
            |row| {
                let payload: String = row.get(4)?;
                Ok(RejectedBar {
                    symbol: row.get(0)?,
                    provider: parse_col(row, 1)?,
                    trade_date: parse_opt_col(row, 2)?,
                    reason: row.get(3)?,
                    payload: serde_json::from_str(&payload)
                        .map_err(|e| conversion_error(4, Type::Text, e.to_string()))?,
                    rejected_at: ts_col(row, 5)?,
                })
            },
        )
    }

    fn record_drift(&self, flags: &[DriftFlag]) -> Result<usize, StoreError> {
        self.write_keyed(
            "drift_flags",
            "INSERT INTO drift_flags
                (symbol, trade_date, provider, prev_close, close, day_return, threshold, flagged_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(symbol, trade_date) DO UPDATE SET
                provider   = excluded.provider,
                prev_close = excluded.prev_close,
                close      = excluded.close,
                day_return = excluded.day_return,
                threshold  = excluded.threshold,
                flagged_at = excluded.flagged_at",
            flags,
            |f| (f.symbol.clone(), f.trade_date),
            |stmt, f| {
                stmt.execute(params![
                    f.symbol,
                    f.trade_date.to_string(),
                    f.provider.as_str(),
                    f.prev_close,
                    f.close,
                    f.day_return,
                    f.threshold,
                    micros(f.flagged_at),
                ])
            },
        )
    }

    fn drift_flags(&self, symbol: &str) -> Result<Vec<DriftFlag>, StoreError> {
        self.query_rows(
            "SELECT symbol, trade_date, provider, prev_close, close, day_return, threshold, flagged_at
             FROM drift_flags WHERE symbol = ?1 ORDER BY trade_date",
            params![symbol],
            |row| {
                Ok(DriftFlag {
                    symbol: row.get(0)?,
                    trade_date: parse_col(row, 1)?,
                    provider: parse_col(row, 2)?,
                    prev_close: row.get(3)?,
                    close: row.get(4)?,
                    day_return: row.get(5)?,
                    threshold: row.get(6)?,
                    flagged_at: ts_col(row, 7)?,
                })
            },
        )
    }
}
