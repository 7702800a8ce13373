//! CSV export of the joined read contract.

use std::path::Path;

use anyhow::{Context, Result};
use maco_core::store::JoinedRow;

const COLUMNS: [&str; 17] = [
    "symbol",
    "trade_date",
    "open",
    "high",
    "low",
    "close",
    "adj_close",
    "volume",
    "provider",
    "sma_fast",
    "sma_slow",
    "signal",
    "crossover_sign",
    "predicted_signal",
    "predicted_direction",
    "predicted_close",
    "generated_at",
];

fn opt_num(v: Option<f64>) -> String {
    v.map(|x| format!("{x:.6}")).unwrap_or_default()
}

fn opt_text<T: ToString>(v: Option<T>) -> String {
    v.map(|x| x.to_string()).unwrap_or_default()
}

/// Joined rows as CSV. Missing derived values are empty cells.
pub fn export_joined_csv(rows: &[JoinedRow]) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(COLUMNS)?;

    for r in rows {
        wtr.write_record([
            r.symbol.clone(),
            r.trade_date.to_string(),
            format!("{:.6}", r.open),
            format!("{:.6}", r.high),
            format!("{:.6}", r.low),
            format!("{:.6}", r.close),
            opt_num(r.adj_close),
            r.volume.to_string(),
            r.provider.to_string(),
            opt_num(r.sma_fast),
            opt_num(r.sma_slow),
            opt_text(r.signal),
            opt_text(r.crossover_sign),
            opt_text(r.predicted_signal),
            opt_text(r.predicted_direction),
            opt_num(r.predicted_close),
            r.generated_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        ])?;
    }

    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

/// Write joined rows to `path`, creating parent directories.
pub fn write_joined_csv(rows: &[JoinedRow], path: &Path) -> Result<()> {
    let csv = export_joined_csv(rows)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }
    std::fs::write(path, csv).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use maco_core::domain::{CrossSign, Direction, ProviderName, SignalKind};

    fn row(with_derived: bool) -> JoinedRow {
        JoinedRow {
            symbol: "AAPL".into(),
            trade_date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            open: 10.0,
            high: 11.0,
            low: 9.5,
            close: 10.5,
            adj_close: None,
            volume: 1000,
            provider: ProviderName::Yahoo,
            sma_fast: with_derived.then_some(10.25),
            sma_slow: with_derived.then_some(10.0),
            signal: with_derived.then_some(SignalKind::Buy),
            crossover_sign: with_derived.then_some(CrossSign::Pos),
            predicted_signal: with_derived.then_some(SignalKind::Hold),
            predicted_direction: with_derived.then_some(Direction::Up),
            predicted_close: with_derived.then_some(10.5),
            generated_at: with_derived
                .then(|| Utc.with_ymd_and_hms(2024, 1, 3, 6, 0, 0).unwrap()),
        }
    }

    #[test]
    fn header_and_rows() {
        let csv = export_joined_csv(&[row(true), row(false)]).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("symbol,trade_date,open"));
        assert!(lines[1].contains(",yahoo,10.250000,10.000000,BUY,POS,HOLD,"));
        assert!(lines[1].ends_with("2024-01-03T06:00:00+00:00"));
        assert!(lines[2].ends_with(",yahoo,,,,,,,,"));
    }

    #[test]
    fn writes_file_with_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports").join("aapl.csv");
        write_joined_csv(&[row(true)], &path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
