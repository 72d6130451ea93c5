//! Core market data types shared by scoring, simulation and optimization
//!
//! These types define the contract with the market-data and indicator
//! collaborators: ordered OHLCV bars per instrument and one indicator
//! snapshot per bar.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Price candle data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    pub fn close_f64(&self) -> f64 {
        self.close.to_f64().unwrap_or(0.0)
    }

    pub fn high_f64(&self) -> f64 {
        self.high.to_f64().unwrap_or(0.0)
    }

    pub fn low_f64(&self) -> f64 {
        self.low.to_f64().unwrap_or(0.0)
    }

    pub fn volume_f64(&self) -> f64 {
        self.volume.to_f64().unwrap_or(0.0)
    }
}

/// Ordered bar history for one instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentSeries {
    pub instrument: String,
    pub candles: Vec<Candle>,
}

impl InstrumentSeries {
    pub fn new(instrument: impl Into<String>, candles: Vec<Candle>) -> Self {
        Self {
            instrument: instrument.into(),
            candles,
        }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Sort by timestamp and drop duplicate bars. Gaps are left alone.
    pub fn normalize(&mut self) {
        self.candles.sort_by_key(|c| c.timestamp);
        self.candles.dedup_by_key(|c| c.timestamp);
    }
}

/// Fully materialized market history for a universe of instruments
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
    pub instruments: Vec<InstrumentSeries>,
}

impl Dataset {
    pub fn new(instruments: Vec<InstrumentSeries>) -> Self {
        Self { instruments }
    }

    pub fn total_bars(&self) -> usize {
        self.instruments.iter().map(|s| s.len()).sum()
    }

    pub fn get(&self, instrument: &str) -> Option<&InstrumentSeries> {
        self.instruments.iter().find(|s| s.instrument == instrument)
    }
}

/// Precomputed indicator values for one bar.
///
/// Every value is optional: a missing or non-finite input from the indicator
/// collaborator is "unavailable" and consumers fall back instead of scoring it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub close: f64,
    pub rsi: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_hist: Option<f64>,
    pub prev_macd_hist: Option<f64>,
    pub adx: Option<f64>,
    pub atr: Option<f64>,
    pub volume: Option<f64>,
    pub volume_sma: Option<f64>,
    /// Long trend average (200 bars, or all history when shorter)
    pub long_ma: Option<f64>,
    /// Lowest low of the trailing 20 bars
    pub support: Option<f64>,
    pub close_sma5: Option<f64>,
    /// Percent change over the last 5 bars
    pub momentum_5: Option<f64>,
    /// Annualized volatility of the trailing 20 bar returns, in percent
    pub volatility: Option<f64>,
    /// Trend strength, 0-100
    pub trend_strength: Option<f64>,
    /// Base technical score, 0-100
    pub base_score: Option<f64>,
}

impl IndicatorSnapshot {
    /// Drop non-finite values so they can never leak into a score
    pub fn sanitized(mut self) -> Self {
        for slot in [
            &mut self.rsi,
            &mut self.macd,
            &mut self.macd_signal,
            &mut self.macd_hist,
            &mut self.prev_macd_hist,
            &mut self.adx,
            &mut self.atr,
            &mut self.volume,
            &mut self.volume_sma,
            &mut self.long_ma,
            &mut self.support,
            &mut self.close_sma5,
            &mut self.momentum_5,
            &mut self.volatility,
            &mut self.trend_strength,
            &mut self.base_score,
        ] {
            *slot = slot.and_then(finite);
        }
        if !self.close.is_finite() {
            self.close = 0.0;
        }
        self
    }

    /// ATR as a percent of close
    pub fn atr_pct(&self) -> Option<f64> {
        let atr = self.atr?;
        if self.close > 0.0 {
            finite(atr / self.close * 100.0)
        } else {
            None
        }
    }

    pub fn volume_ratio(&self) -> Option<f64> {
        let volume = self.volume?;
        let sma = self.volume_sma?;
        if sma > 0.0 {
            finite(volume / sma)
        } else {
            None
        }
    }
}

/// Keep a value only when it is a real number
pub fn finite(value: f64) -> Option<f64> {
    if value.is_finite() {
        Some(value)
    } else {
        None
    }
}
