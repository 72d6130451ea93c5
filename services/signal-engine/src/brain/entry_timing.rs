//! Entry timing scorer
//!
//! Looks back over a short window ending at the signal bar and rates how
//! good an entry the signal bar offers: close to the window's pullback low,
//! inside a tight consolidation.

use serde::{Deserialize, Serialize};

use crate::types::Candle;

/// Range (percent of price) at which tightness falls to one half
const TIGHTNESS_REFERENCE_PCT: f64 = 5.0;

const PULLBACK_WEIGHT: f64 = 0.6;
const TIGHTNESS_WEIGHT: f64 = 0.4;

/// Fewest bars that make a usable window
pub const MIN_WINDOW: usize = 3;

/// Timing assessment for one signal bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntryTiming {
    /// Continuous confidence in [0, 1]
    pub confidence: f64,
    /// Lowest close in the window, the most favorable entry seen
    pub best_entry_price: f64,
    /// 1.0 when the signal close sits on the best entry, 0.0 at the window high
    pub pullback: f64,
    /// 1.0 for a flat window, falling as the range widens
    pub tightness: f64,
}

impl EntryTiming {
    /// Confidence on the 0-100 scale
    pub fn score(&self) -> f64 {
        (self.confidence * 100.0).clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EntryTimingScorer {
    window: usize,
}

impl EntryTimingScorer {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(MIN_WINDOW),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Score the last bar of `history`. Only bars up to and including the
    /// signal bar are read. Returns `None` when fewer than three bars exist.
    pub fn score(&self, history: &[Candle]) -> Option<EntryTiming> {
        if history.len() < MIN_WINDOW {
            return None;
        }
        let start = history.len().saturating_sub(self.window);
        let window = &history[start..];
        let signal_close = window.last()?.close_f64();

        let best_entry_price = window
            .iter()
            .map(Candle::close_f64)
            .reduce(f64::min)?;
        let high = window.iter().map(Candle::high_f64).reduce(f64::max)?;
        let low = window.iter().map(Candle::low_f64).reduce(f64::min)?;
        let mean_close =
            window.iter().map(Candle::close_f64).sum::<f64>() / window.len() as f64;

        if !(signal_close.is_finite() && mean_close > 0.0) {
            return None;
        }

        let span = high - best_entry_price;
        let pullback = if span > 0.0 {
            (1.0 - (signal_close - best_entry_price) / span).clamp(0.0, 1.0)
        } else {
            1.0
        };

        let range_pct = ((high - low) / mean_close * 100.0).max(0.0);
        let tightness = 1.0 / (1.0 + range_pct / TIGHTNESS_REFERENCE_PCT);

        let confidence =
            (PULLBACK_WEIGHT * pullback + TIGHTNESS_WEIGHT * tightness).clamp(0.0, 1.0);

        Some(EntryTiming {
            confidence,
            best_entry_price,
            pullback,
            tightness,
        })
    }
}

impl Default for EntryTimingScorer {
    fn default() -> Self {
        Self::new(10)
    }
}
