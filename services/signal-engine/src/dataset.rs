//! Dataset loading and preparation
//!
//! Market history is read fully into memory before any scoring. Two layouts
//! are accepted: a JSON `Dataset` document, or a flat CSV with one row per bar
//! (`instrument,timestamp,open,high,low,close,volume`).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::errors::{EngineError, Result};
use crate::indicators::{IndicatorProvider, PreparedSeries};
use crate::types::{Candle, Dataset, InstrumentSeries};

#[derive(Debug, Deserialize)]
struct CsvBar {
    instrument: String,
    timestamp: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
}

/// Load a dataset and normalize every series
pub async fn load_dataset(path: &Path) -> Result<Dataset> {
    let raw = fs::read_to_string(path).await?;
    let is_csv = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);

    let mut dataset = if is_csv {
        parse_csv(&raw)?
    } else {
        serde_json::from_str::<Dataset>(&raw)?
    };

    for series in dataset.instruments.iter_mut() {
        let before = series.len();
        series.normalize();
        if series.len() != before {
            debug!(
                instrument = %series.instrument,
                "Dropped {} duplicate bars",
                before - series.len()
            );
        }
    }

    info!(
        instruments = dataset.instruments.len(),
        bars = dataset.total_bars(),
        "Loaded dataset from {}",
        path.display()
    );
    Ok(dataset)
}

/// Parse the flat CSV layout, grouping rows by instrument
pub fn parse_csv(raw: &str) -> Result<Dataset> {
    let mut reader = csv::Reader::from_reader(raw.as_bytes());
    let mut grouped: BTreeMap<String, Vec<Candle>> = BTreeMap::new();
    for row in reader.deserialize::<CsvBar>() {
        let bar = row?;
        grouped.entry(bar.instrument).or_default().push(Candle {
            timestamp: bar.timestamp,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
        });
    }
    Ok(Dataset::new(
        grouped
            .into_iter()
            .map(|(instrument, candles)| InstrumentSeries::new(instrument, candles))
            .collect(),
    ))
}

/// Precompute indicator snapshots for every instrument.
///
/// Series the provider cannot align are left out with a warning; short series
/// are kept so that scans and backtests can report them as insufficient.
pub fn prepare_universe(dataset: &Dataset, provider: &dyn IndicatorProvider) -> Vec<PreparedSeries> {
    dataset
        .instruments
        .iter()
        .filter_map(|series| match PreparedSeries::prepare(series, provider) {
            Ok(prepared) => Some(prepared),
            Err(e) => {
                warn!(instrument = %series.instrument, kind = %e.kind(), "Not prepared: {}", e);
                None
            }
        })
        .collect()
}

/// Fail early when nothing in the dataset could ever be scored
pub fn ensure_usable(universe: &[PreparedSeries], min_bars: usize) -> Result<()> {
    if universe.iter().any(|s| s.len() >= min_bars) {
        Ok(())
    } else {
        Err(EngineError::insufficient(
            "dataset",
            format!("no instrument has {} bars", min_bars),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::StandardIndicators;

    const CSV: &str = "\
instrument,timestamp,open,high,low,close,volume
BBB,2025-01-02T00:00:00Z,10,11,9,10.5,100
AAA,2025-01-02T00:00:00Z,20,21,19,20.5,200
AAA,2025-01-01T00:00:00Z,19,20,18,19.5,150
";

    #[test]
    fn test_parse_csv_groups_by_instrument() {
        let dataset = parse_csv(CSV).unwrap();
        assert_eq!(dataset.instruments.len(), 2);
        assert_eq!(dataset.instruments[0].instrument, "AAA");
        assert_eq!(dataset.get("AAA").unwrap().len(), 2);
        assert_eq!(dataset.total_bars(), 3);
    }

    #[test]
    fn test_bad_csv_is_serialization_error() {
        let err = parse_csv("instrument,timestamp\nAAA,not-a-date\n").unwrap_err();
        assert_eq!(err.kind().as_str(), "serialization");
    }

    #[tokio::test]
    async fn test_load_normalizes_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bars.csv");
        std::fs::write(&path, CSV).unwrap();

        let dataset = load_dataset(&path).await.unwrap();
        let aaa = dataset.get("AAA").unwrap();
        assert!(aaa.candles[0].timestamp < aaa.candles[1].timestamp);
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let err = load_dataset(Path::new("/nonexistent/bars.json")).await.unwrap_err();
        assert_eq!(err.kind().as_str(), "io");
    }

    #[test]
    fn test_short_universe_not_usable() {
        let dataset = parse_csv(CSV).unwrap();
        let universe = prepare_universe(&dataset, &StandardIndicators);
        assert_eq!(universe.len(), 2);
        assert!(ensure_usable(&universe, 50).is_err());
        assert!(ensure_usable(&universe, 2).is_ok());
    }
}
