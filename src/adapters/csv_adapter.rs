//! CSV bar provider and trade/equity export.
//!
//! Bars live in `<dir>/<SYMBOL>_<timeframe>.csv`, one file per series, with
//! the header `timestamp,datetime,open,high,low,close,volume`. The datetime
//! column is informational; `timestamp` (epoch milliseconds of the bar open)
//! is authoritative.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::error::ConfluenceError;
use crate::domain::ohlcv::{format_timestamp, Bar};
use crate::domain::performance::EquityPoint;
use crate::domain::position::Trade;
use crate::domain::timeframe::Timeframe;
use crate::ports::data_port::DataProvider;

pub const BAR_HEADER: [&str; 7] = [
    "timestamp", "datetime", "open", "high", "low", "close", "volume",
];

pub struct CsvBarProvider {
    base_path: PathBuf,
}

impl CsvBarProvider {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn csv_path(&self, symbol: &str, timeframe: Timeframe) -> PathBuf {
        self.base_path.join(format!("{symbol}_{timeframe}.csv"))
    }
}

fn provider_error(reason: String) -> ConfluenceError {
    ConfluenceError::DataProvider { reason }
}

fn field<T: std::str::FromStr>(
    record: &csv::StringRecord,
    index: usize,
    path: &Path,
) -> Result<T, ConfluenceError>
where
    T::Err: std::fmt::Display,
{
    let name = BAR_HEADER[index];
    let raw = record.get(index).ok_or_else(|| {
        provider_error(format!("{}: missing {name} column", path.display()))
    })?;
    raw.trim().parse().map_err(|e| {
        provider_error(format!("{}: invalid {name} value '{raw}': {e}", path.display()))
    })
}

impl DataProvider for CsvBarProvider {
    fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Bar>, ConfluenceError> {
        let path = self.csv_path(symbol, timeframe);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut rdr = csv::Reader::from_path(&path)
            .map_err(|e| provider_error(format!("failed to read {}: {e}", path.display())))?;
        let mut bars = Vec::new();
        let mut previous: Option<i64> = None;

        for result in rdr.records() {
            let record = result
                .map_err(|e| provider_error(format!("{}: CSV parse error: {e}", path.display())))?;

            let timestamp: i64 = field(&record, 0, &path)?;
            if let Some(prev) = previous {
                if timestamp <= prev {
                    return Err(provider_error(format!(
                        "{}: timestamp {timestamp} not after previous row {prev}",
                        path.display()
                    )));
                }
            }
            previous = Some(timestamp);
            if timestamp < start_ms || timestamp > end_ms {
                continue;
            }

            bars.push(Bar {
                symbol: symbol.to_string(),
                timeframe,
                timestamp,
                open: field(&record, 2, &path)?,
                high: field(&record, 3, &path)?,
                low: field(&record, 4, &path)?,
                close: field(&record, 5, &path)?,
                volume: field(&record, 6, &path)?,
            });
        }

        Ok(bars)
    }

    fn list_symbols(&self) -> Result<Vec<String>, ConfluenceError> {
        let entries = fs::read_dir(&self.base_path).map_err(|e| {
            provider_error(format!(
                "failed to read directory {}: {e}",
                self.base_path.display()
            ))
        })?;

        let mut symbols = BTreeSet::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| provider_error(format!("directory entry error: {e}")))?;
            let name = entry.file_name();
            let Some(stem) = name.to_string_lossy().strip_suffix(".csv").map(str::to_string)
            else {
                continue;
            };
            if let Some((symbol, tf)) = stem.rsplit_once('_') {
                if tf.parse::<Timeframe>().is_ok() && !symbol.is_empty() {
                    symbols.insert(symbol.to_string());
                }
            }
        }

        Ok(symbols.into_iter().collect())
    }
}

/// Write bars in the provider's file layout.
pub fn write_bars(path: &Path, bars: &[Bar]) -> Result<(), ConfluenceError> {
    let mut wtr = csv::Writer::from_path(path).map_err(csv_error)?;
    wtr.write_record(BAR_HEADER).map_err(csv_error)?;
    for bar in bars {
        wtr.write_record([
            bar.timestamp.to_string(),
            bar.datetime(),
            bar.open.to_string(),
            bar.high.to_string(),
            bar.low.to_string(),
            bar.close.to_string(),
            bar.volume.to_string(),
        ])
        .map_err(csv_error)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_trades(path: &Path, trades: &[Trade]) -> Result<(), ConfluenceError> {
    let mut wtr = csv::Writer::from_path(path).map_err(csv_error)?;
    wtr.write_record([
        "symbol",
        "direction",
        "size",
        "entry_time",
        "entry_price",
        "exit_time",
        "exit_price",
        "pnl",
        "fees",
        "net_pnl",
        "exit_reason",
    ])
    .map_err(csv_error)?;
    for t in trades {
        wtr.write_record([
            t.symbol.clone(),
            t.direction.to_string(),
            t.size.to_string(),
            format_timestamp(t.entry_timestamp),
            t.entry_price.to_string(),
            format_timestamp(t.exit_timestamp),
            t.exit_price.to_string(),
            format!("{:.8}", t.pnl),
            format!("{:.8}", t.fees),
            format!("{:.8}", t.net_pnl()),
            t.exit_reason.to_string(),
        ])
        .map_err(csv_error)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_equity_curve(path: &Path, points: &[EquityPoint]) -> Result<(), ConfluenceError> {
    let mut wtr = csv::Writer::from_path(path).map_err(csv_error)?;
    wtr.write_record(["timestamp", "datetime", "equity", "balance"])
        .map_err(csv_error)?;
    for p in points {
        wtr.write_record([
            p.timestamp.to_string(),
            format_timestamp(p.timestamp),
            format!("{:.8}", p.equity),
            format!("{:.8}", p.balance),
        ])
        .map_err(csv_error)?;
    }
    wtr.flush()?;
    Ok(())
}

fn csv_error(e: csv::Error) -> ConfluenceError {
    ConfluenceError::Io(std::io::Error::other(e))
}
