//! Raw payload landing zone with Hive-style partitioning.
//!
//! Layout: `{root}/raw/{provider}/{symbol}/date={YYYY-MM-DD}/candles.{parquet|json}`
//! with a `meta.json` sidecar per partition.
//!
//! - Yahoo rows are written as Parquet, everything else as JSON
//! - Writes are atomic: each lands in a uniquely named temp file in the
//!   partition directory and is renamed into place
//! - The sidecar carries a BLAKE3 hash of the partition's rows

use chrono::{DateTime, NaiveDate, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::data::normalize::raw_trade_date;
use crate::data::provider::{RawBar, YahooRow};
use crate::domain::ProviderName;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parquet: {0}")]
    Parquet(String),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no archived payload at {0}")]
    Missing(PathBuf),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Sidecar describing one archived partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMeta {
    pub provider: ProviderName,
    pub symbol: String,
    pub trade_date: NaiveDate,
    pub rows: usize,
    pub format: String,
    pub data_hash: String,
    pub fetched_at: DateTime<Utc>,
}

pub struct RawArchive {
    root: PathBuf,
}

impl RawArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_dir(&self, provider: ProviderName, symbol: &str, date: NaiveDate) -> PathBuf {
        self.root
            .join("raw")
            .join(provider.as_str())
            .join(symbol)
            .join(format!("date={date}"))
    }

    fn extension(provider: ProviderName) -> &'static str {
        match provider {
            ProviderName::Yahoo => "parquet",
            ProviderName::Finnhub | ProviderName::Synthetic => "json",
        }
    }

    /// Archive raw records as fetched, one partition per trade date.
    /// Records without a usable date land under `fallback_date`.
    pub fn write(
        &self,
        provider: ProviderName,
        symbol: &str,
        raws: &[RawBar],
        fallback_date: NaiveDate,
        fetched_at: DateTime<Utc>,
    ) -> Result<Vec<PathBuf>, ArchiveError> {
        let mut by_date: BTreeMap<NaiveDate, Vec<&RawBar>> = BTreeMap::new();
        for raw in raws {
            let date = raw_trade_date(raw).unwrap_or(fallback_date);
            by_date.entry(date).or_default().push(raw);
        }

        let mut written = Vec::with_capacity(by_date.len());
        for (date, rows) in by_date {
            let dir = self.partition_dir(provider, symbol, date);
            fs::create_dir_all(&dir).map_err(io_err(&dir))?;

            let ext = Self::extension(provider);
            let path = dir.join(format!("candles.{ext}"));
            replace_file(&dir, &path, |file| match provider {
                ProviderName::Yahoo => write_parquet(&yahoo_frame(&rows)?, file),
                _ => {
                    serde_json::to_writer_pretty(&mut *file, &rows)?;
                    Ok(())
                }
            })?;

            let meta = ArchiveMeta {
                provider,
                symbol: symbol.to_string(),
                trade_date: date,
                rows: rows.len(),
                format: ext.to_string(),
                data_hash: blake3::hash(&serde_json::to_vec(&rows)?).to_hex().to_string(),
                fetched_at,
            };
            replace_file(&dir, &dir.join("meta.json"), |file| {
                serde_json::to_writer_pretty(&mut *file, &meta)?;
                Ok(())
            })?;

            written.push(path);
        }

        debug!(%provider, symbol, partitions = written.len(), "raw payload archived");
        Ok(written)
    }

    /// Read one archived partition back.
    pub fn load(
        &self,
        provider: ProviderName,
        symbol: &str,
        date: NaiveDate,
    ) -> Result<Vec<RawBar>, ArchiveError> {
        let path = self
            .partition_dir(provider, symbol, date)
            .join(format!("candles.{}", Self::extension(provider)));
        if !path.exists() {
            return Err(ArchiveError::Missing(path));
        }
        match provider {
            ProviderName::Yahoo => read_yahoo_parquet(&path),
            _ => {
                let bytes = fs::read(&path).map_err(io_err(&path))?;
                Ok(serde_json::from_slice(&bytes)?)
            }
        }
    }

    pub fn meta(
        &self,
        provider: ProviderName,
        symbol: &str,
        date: NaiveDate,
    ) -> Result<ArchiveMeta, ArchiveError> {
        let path = self.partition_dir(provider, symbol, date).join("meta.json");
        let content = fs::read_to_string(&path).map_err(io_err(&path))?;
        Ok(serde_json::from_str(&content)?)
    }
}

// ── Parquet I/O helpers ──

fn yahoo_frame(rows: &[&RawBar]) -> Result<DataFrame, ArchiveError> {
    let yahoo: Vec<&YahooRow> = rows
        .iter()
        .filter_map(|r| match r {
            RawBar::Yahoo(row) => Some(row),
            _ => None,
        })
        .collect();

    let timestamps: Vec<i64> = yahoo.iter().map(|r| r.timestamp).collect();
    let opens: Vec<Option<f64>> = yahoo.iter().map(|r| r.open).collect();
    let highs: Vec<Option<f64>> = yahoo.iter().map(|r| r.high).collect();
    let lows: Vec<Option<f64>> = yahoo.iter().map(|r| r.low).collect();
    let closes: Vec<Option<f64>> = yahoo.iter().map(|r| r.close).collect();
    let adj_closes: Vec<Option<f64>> = yahoo.iter().map(|r| r.adj_close).collect();
    let volumes: Vec<Option<u64>> = yahoo.iter().map(|r| r.volume).collect();

    DataFrame::new(vec![
        Column::new("timestamp".into(), timestamps),
        Column::new("open".into(), opens),
        Column::new("high".into(), highs),
        Column::new("low".into(), lows),
        Column::new("close".into(), closes),
        Column::new("adj_close".into(), adj_closes),
        Column::new("volume".into(), volumes),
    ])
    .map_err(|e| ArchiveError::Parquet(format!("dataframe creation: {e}")))
}

/// Write through a temp file unique to this call, then rename over `path`.
/// Concurrent writers of one partition never share a temp file; the last
/// rename wins.
fn replace_file<F>(dir: &Path, path: &Path, fill: F) -> Result<(), ArchiveError>
where
    F: FnOnce(&mut fs::File) -> Result<(), ArchiveError>,
{
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)
        .map_err(io_err(dir))?;
    fill(tmp.as_file_mut())?;
    tmp.as_file_mut().flush().map_err(io_err(tmp.path()))?;
    tmp.persist(path).map_err(|e| io_err(path)(e.error))?;
    Ok(())
}

fn write_parquet(df: &DataFrame, file: &mut fs::File) -> Result<(), ArchiveError> {
    ParquetWriter::new(file)
        .finish(&mut df.clone())
        .map_err(|e| ArchiveError::Parquet(format!("write: {e}")))?;
    Ok(())
}

fn read_yahoo_parquet(path: &Path) -> Result<Vec<RawBar>, ArchiveError> {
    let file = fs::File::open(path).map_err(io_err(path))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| ArchiveError::Parquet(format!("read: {e}")))?;

    let col_err = |e: PolarsError| ArchiveError::Parquet(format!("column read: {e}"));
    let ts = df.column("timestamp").map_err(col_err)?.i64().map_err(col_err)?;
    let open = df.column("open").map_err(col_err)?.f64().map_err(col_err)?;
    let high = df.column("high").map_err(col_err)?.f64().map_err(col_err)?;
    let low = df.column("low").map_err(col_err)?.f64().map_err(col_err)?;
    let close = df.column("close").map_err(col_err)?.f64().map_err(col_err)?;
    let adj = df.column("adj_close").map_err(col_err)?.f64().map_err(col_err)?;
    let volume = df.column("volume").map_err(col_err)?.u64().map_err(col_err)?;

    (0..df.height())
        .map(|i| {
            let timestamp = ts
                .get(i)
                .ok_or_else(|| ArchiveError::Parquet(format!("null timestamp at row {i}")))?;
            Ok(RawBar::Yahoo(YahooRow {
                timestamp,
                open: open.get(i),
                high: high.get(i),
                low: low.get(i),
                close: close.get(i),
                adj_close: adj.get(i),
                volume: volume.get(i),
            }))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::provider::{date_to_epoch, FinnhubCandle};

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn yahoo(day: u32, close: Option<f64>) -> RawBar {
        RawBar::Yahoo(YahooRow {
            timestamp: date_to_epoch(d(day)) + 52_200,
            open: Some(100.0),
            high: Some(102.0),
            low: Some(99.0),
            close,
            adj_close: None,
            volume: Some(1_000),
        })
    }

    #[test]
    fn yahoo_rows_round_trip_through_parquet() {
        let dir = tempfile::tempdir().unwrap();
        let archive = RawArchive::new(dir.path());
        let raws = vec![yahoo(2, Some(101.0)), yahoo(3, None)];

        let paths = archive
            .write(ProviderName::Yahoo, "AAPL", &raws, d(3), Utc::now())
            .unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("raw/yahoo/AAPL/date=2024-01-02/candles.parquet"));

        assert_eq!(archive.load(ProviderName::Yahoo, "AAPL", d(3)).unwrap(), vec![raws[1].clone()]);
        assert_eq!(archive.load(ProviderName::Yahoo, "AAPL", d(2)).unwrap(), vec![raws[0].clone()]);
    }

    #[test]
    fn finnhub_rows_are_json_with_meta() {
        let dir = tempfile::tempdir().unwrap();
        let archive = RawArchive::new(dir.path());
        let raw = RawBar::Finnhub(FinnhubCandle {
            timestamp: date_to_epoch(d(2)),
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.25,
        });

        archive
            .write(ProviderName::Finnhub, "BTC-USD", std::slice::from_ref(&raw), d(2), Utc::now())
            .unwrap();
        assert_eq!(archive.load(ProviderName::Finnhub, "BTC-USD", d(2)).unwrap(), vec![raw]);

        let meta = archive.meta(ProviderName::Finnhub, "BTC-USD", d(2)).unwrap();
        assert_eq!(meta.rows, 1);
        assert_eq!(meta.format, "json");
        assert_eq!(meta.data_hash.len(), 64);
        let partition = dir.path().join("raw/finnhub/BTC-USD/date=2024-01-02");
        let mut names: Vec<String> = fs::read_dir(&partition)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, ["candles.json", "meta.json"]);
    }

    #[test]
    fn concurrent_writers_of_one_partition_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let archive = RawArchive::new(dir.path());
        std::thread::scope(|scope| {
            for i in 0..8 {
                let archive = &archive;
                scope.spawn(move || {
                    let raws = [yahoo(2, Some(100.0 + i as f64))];
                    archive
                        .write(ProviderName::Yahoo, "AAPL", &raws, d(2), Utc::now())
                        .unwrap();
                });
            }
        });

        let loaded = archive.load(ProviderName::Yahoo, "AAPL", d(2)).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(archive.meta(ProviderName::Yahoo, "AAPL", d(2)).unwrap().rows, 1);
        let leftovers = fs::read_dir(dir.path().join("raw/yahoo/AAPL/date=2024-01-02"))
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn rewriting_a_partition_replaces_it() {
        let dir = tempfile::tempdir().unwrap();
        let archive = RawArchive::new(dir.path());
        archive
            .write(ProviderName::Yahoo, "AAPL", &[yahoo(2, Some(101.0))], d(2), Utc::now())
            .unwrap();
        let first = archive.meta(ProviderName::Yahoo, "AAPL", d(2)).unwrap();
        archive
            .write(ProviderName::Yahoo, "AAPL", &[yahoo(2, Some(105.0))], d(2), Utc::now())
            .unwrap();
        let second = archive.meta(ProviderName::Yahoo, "AAPL", d(2)).unwrap();
        assert_ne!(first.data_hash, second.data_hash);
        assert_eq!(archive.load(ProviderName::Yahoo, "AAPL", d(2)).unwrap().len(), 1);
    }

    #[test]
    fn missing_partition_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let archive = RawArchive::new(dir.path());
        assert!(matches!(
            archive.load(ProviderName::Yahoo, "AAPL", d(2)),
            Err(ArchiveError::Missing(_))
        ));
    }
}
