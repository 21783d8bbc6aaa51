//! CSV bar feed
//!
//! Columns: `start_time,open,high,low,close[,volume][,is_complete]` (`timestamp`
//! and `complete` are accepted too). The time is either epoch milliseconds or an
//! RFC 3339 string.

use anyhow::{bail, Context, Result};
use chrono::DateTime;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, info};

use crate::trading_core::Bar;

#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(alias = "start_time")]
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
    #[serde(default, alias = "is_complete")]
    complete: Option<bool>,
}

fn parse_timestamp(raw: &str) -> Result<i64> {
    let raw = raw.trim();
    if let Ok(ms) = raw.parse::<i64>() {
        return Ok(ms);
    }
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp: {}", raw))?;
    Ok(parsed.timestamp_millis())
}

/// Parse bars from any CSV reader
pub fn read_bars<R: Read>(reader: R, include_incomplete: bool) -> Result<Vec<Bar>> {
    let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut bars = Vec::new();
    let mut skipped = 0usize;

    for (line, result) in csv_reader.deserialize().enumerate() {
        let row: CsvRow = result.with_context(|| format!("Failed to parse CSV row {}", line + 1))?;
        let start_time = parse_timestamp(&row.timestamp).with_context(|| format!("Row {}", line + 1))?;
        if row.high < row.low {
            bail!("Row {}: high {} below low {}", line + 1, row.high, row.low);
        }

        let mut bar = Bar::new(start_time, row.open, row.high, row.low, row.close, row.volume);
        bar.is_complete = row.complete.unwrap_or(true);
        if !bar.is_complete && !include_incomplete {
            skipped += 1;
            continue;
        }
        bars.push(bar);
    }

    if skipped > 0 {
        debug!("Skipped {} incomplete bars", skipped);
    }
    Ok(bars)
}

/// Load bars from a CSV file
pub fn load_bars(path: &Path, include_incomplete: bool) -> Result<Vec<Bar>> {
    let file = File::open(path).with_context(|| format!("Failed to open file: {:?}", path))?;
    let bars = read_bars(BufReader::new(file), include_incomplete)?;
    info!("Loaded {} bars from {:?}", bars.len(), path);
    Ok(bars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_epoch_and_rfc3339_rows() {
        let data = "timestamp,open,high,low,close,volume\n\
                    60000,100.0,101.0,99.5,100.5,12\n\
                    1970-01-01T00:02:00Z,100.5,102.0,100.0,101.75,8\n";
        let bars = read_bars(data.as_bytes(), false).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].start_time, 60_000);
        assert_eq!(bars[1].start_time, 120_000);
        assert_eq!(bars[1].close, 101.75);
        assert!(bars.iter().all(|b| b.is_complete));
    }

    #[test]
    fn test_volume_optional_and_incomplete_filtered() {
        let data = "timestamp,open,high,low,close,complete\n\
                    0,1.0,2.0,0.5,1.5,true\n\
                    60000,1.5,2.5,1.0,2.0,false\n";
        let bars = read_bars(data.as_bytes(), false).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].volume, 0.0);

        let bars = read_bars(data.as_bytes(), true).unwrap();
        assert_eq!(bars.len(), 2);
        assert!(!bars[1].is_complete);
    }

    #[test]
    fn test_accepts_bar_field_names() {
        let data = "start_time,open,high,low,close,volume,is_complete\n\
                    0,1.0,2.0,0.5,1.5,3,true\n";
        let bars = read_bars(data.as_bytes(), false).unwrap();
        assert_eq!(bars, vec![Bar::new(0, 1.0, 2.0, 0.5, 1.5, 3.0)]);
    }

    #[test]
    fn test_rejects_bad_rows() {
        let inverted = "timestamp,open,high,low,close\n0,1.0,0.5,2.0,1.0\n";
        assert!(read_bars(inverted.as_bytes(), false).is_err());

        let bad_time = "timestamp,open,high,low,close\nyesterday,1.0,2.0,0.5,1.0\n";
        assert!(read_bars(bad_time.as_bytes(), false).is_err());
    }
}
