//! Indicator precomputation
//!
//! Scoring consumes one `IndicatorSnapshot` per bar. Snapshots are computed
//! once per instrument before any walk over the bars, never per bar.

use tracing::debug;

use crate::errors::{EngineError, Result};
use crate::types::{finite, Candle, IndicatorSnapshot, InstrumentSeries};

const RSI_PERIOD: usize = 14;
const ATR_PERIOD: usize = 14;
const ADX_PERIOD: usize = 14;
const MACD_FAST: usize = 12;
const MACD_SLOW: usize = 26;
const MACD_SIGNAL: usize = 9;
const VOLUME_PERIOD: usize = 20;
const SUPPORT_PERIOD: usize = 20;
const LONG_MA_PERIOD: usize = 200;
const VOLATILITY_PERIOD: usize = 20;

/// Source of per-bar indicator values for one instrument
pub trait IndicatorProvider: Send + Sync {
    /// One snapshot per candle, index-aligned with `series.candles`
    fn compute(&self, series: &InstrumentSeries) -> Vec<IndicatorSnapshot>;
}

/// Reference indicator set computed directly from OHLCV
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardIndicators;

impl IndicatorProvider for StandardIndicators {
    fn compute(&self, series: &InstrumentSeries) -> Vec<IndicatorSnapshot> {
        let candles = &series.candles;
        let closes: Vec<f64> = candles.iter().map(Candle::close_f64).collect();
        let volumes: Vec<f64> = candles.iter().map(Candle::volume_f64).collect();

        let rsi = calculate_rsi(&closes, RSI_PERIOD);
        let atr = calculate_atr(candles, ATR_PERIOD);
        let adx = calculate_adx(candles, ADX_PERIOD);
        let ema_fast = calculate_ema(&closes, MACD_FAST);
        let ema_slow = calculate_ema(&closes, MACD_SLOW);
        let ema20 = calculate_ema(&closes, 20);
        let ema50 = calculate_ema(&closes, 50);
        let macd: Vec<Option<f64>> = ema_fast
            .iter()
            .zip(ema_slow.iter())
            .map(|(f, s)| Some((*f)? - (*s)?))
            .collect();
        let macd_signal = calculate_ema_optional(&macd, MACD_SIGNAL);
        let volume_sma = calculate_sma(&volumes, VOLUME_PERIOD);
        let close_sma5 = calculate_sma(&closes, 5);
        let long_ma = expanding_sma(&closes, LONG_MA_PERIOD);

        let mut out = Vec::with_capacity(candles.len());
        for i in 0..candles.len() {
            let close = closes[i];
            let macd_hist = match (macd[i], macd_signal[i]) {
                (Some(m), Some(s)) => Some(m - s),
                _ => None,
            };
            let prev_macd_hist = if i > 0 {
                match (macd[i - 1], macd_signal[i - 1]) {
                    (Some(m), Some(s)) => Some(m - s),
                    _ => None,
                }
            } else {
                None
            };

            let support = if i + 1 >= SUPPORT_PERIOD {
                candles[i + 1 - SUPPORT_PERIOD..=i]
                    .iter()
                    .map(Candle::low_f64)
                    .reduce(f64::min)
            } else {
                None
            };

            let momentum_5 = if i >= 5 && closes[i - 5] > 0.0 {
                finite((close / closes[i - 5] - 1.0) * 100.0)
            } else {
                None
            };

            let volatility = if i >= VOLATILITY_PERIOD {
                annualized_volatility(&closes[i - VOLATILITY_PERIOD..=i])
            } else {
                None
            };

            let trend_strength = trend_strength(close, ema20[i], ema50[i], adx[i], macd[i], macd_signal[i]);
            let base_score = base_score(trend_strength, rsi[i]);

            out.push(
                IndicatorSnapshot {
                    close,
                    rsi: rsi[i],
                    macd: macd[i],
                    macd_signal: macd_signal[i],
                    macd_hist,
                    prev_macd_hist,
                    adx: adx[i],
                    atr: atr[i],
                    volume: Some(volumes[i]),
                    volume_sma: volume_sma[i],
                    long_ma: long_ma[i],
                    support,
                    close_sma5: close_sma5[i],
                    momentum_5,
                    volatility,
                    trend_strength: Some(trend_strength),
                    base_score: Some(base_score),
                }
                .sanitized(),
            );
        }

        debug!(
            instrument = %series.instrument,
            bars = candles.len(),
            "Computed indicator snapshots"
        );
        out
    }
}

/// Bars and their index-aligned snapshots, ready for scoring or simulation
#[derive(Debug, Clone)]
pub struct PreparedSeries {
    pub instrument: String,
    pub candles: Vec<Candle>,
    pub snapshots: Vec<IndicatorSnapshot>,
}

impl PreparedSeries {
    /// Precompute snapshots for a series with the given provider
    pub fn prepare(series: &InstrumentSeries, provider: &dyn IndicatorProvider) -> Result<Self> {
        let snapshots = provider.compute(series);
        Self::from_parts(series.instrument.clone(), series.candles.clone(), snapshots)
    }

    /// Pair externally computed snapshots with their bars
    pub fn from_parts(
        instrument: String,
        candles: Vec<Candle>,
        snapshots: Vec<IndicatorSnapshot>,
    ) -> Result<Self> {
        if candles.len() != snapshots.len() {
            return Err(EngineError::insufficient(
                &instrument,
                format!(
                    "{} snapshots for {} bars",
                    snapshots.len(),
                    candles.len()
                ),
            ));
        }
        let snapshots = snapshots.into_iter().map(IndicatorSnapshot::sanitized).collect();
        Ok(Self {
            instrument,
            candles,
            snapshots,
        })
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

/// Trailing simple moving average; `None` until `period` values exist
pub fn calculate_sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 {
        return out;
    }
    let mut sum = 0.0;
    for (i, v) in values.iter().enumerate() {
        sum += v;
        if i >= period {
            sum -= values[i - period];
        }
        if i + 1 >= period {
            out[i] = finite(sum / period as f64);
        }
    }
    out
}

/// Mean of all history until `period` bars exist, then a rolling mean
fn expanding_sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    let mut sum = 0.0;
    for (i, v) in values.iter().enumerate() {
        sum += v;
        if i >= period {
            sum -= values[i - period];
        }
        let n = (i + 1).min(period);
        out[i] = finite(sum / n as f64);
    }
    out
}

/// EMA seeded with the SMA of the first `period` values
pub fn calculate_ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = finite(ema);
    for i in period..values.len() {
        ema = (values[i] - ema) * multiplier + ema;
        out[i] = finite(ema);
    }
    out
}

/// EMA over a series that starts with unavailable values
fn calculate_ema_optional(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    let start = match values.iter().position(Option::is_some) {
        Some(start) => start,
        None => return vec![None; values.len()],
    };
    let tail: Vec<f64> = values[start..].iter().map(|v| v.unwrap_or(0.0)).collect();
    let mut out = vec![None; start];
    out.extend(calculate_ema(&tail, period));
    out
}

/// Wilder RSI
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() < period + 1 {
        return out;
    }

    let mut gains = 0.0;
    let mut losses = 0.0;
    for i in 1..=period {
        let change = closes[i] - closes[i - 1];
        if change > 0.0 {
            gains += change;
        } else {
            losses -= change;
        }
    }
    let mut avg_gain = gains / period as f64;
    let mut avg_loss = losses / period as f64;
    out[period] = rsi_value(avg_gain, avg_loss);

    for i in (period + 1)..closes.len() {
        let change = closes[i] - closes[i - 1];
        let (gain, loss) = if change > 0.0 { (change, 0.0) } else { (0.0, -change) };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        out[i] = rsi_value(avg_gain, avg_loss);
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    if avg_loss == 0.0 {
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }
    let rs = avg_gain / avg_loss;
    finite(100.0 - 100.0 / (1.0 + rs))
}

fn true_range(current: &Candle, previous: &Candle) -> f64 {
    let high = current.high_f64();
    let low = current.low_f64();
    let prev_close = previous.close_f64();
    (high - low)
        .max((high - prev_close).abs())
        .max((low - prev_close).abs())
}

/// Wilder ATR
pub fn calculate_atr(candles: &[Candle], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; candles.len()];
    if period == 0 || candles.len() < period + 1 {
        return out;
    }
    let mut atr = (1..=period)
        .map(|i| true_range(&candles[i], &candles[i - 1]))
        .sum::<f64>()
        / period as f64;
    out[period] = finite(atr);
    for i in (period + 1)..candles.len() {
        let tr = true_range(&candles[i], &candles[i - 1]);
        atr = (atr * (period as f64 - 1.0) + tr) / period as f64;
        out[i] = finite(atr);
    }
    out
}

/// Wilder ADX from smoothed +DI/-DI
pub fn calculate_adx(candles: &[Candle], period: usize) -> Vec<Option<f64>> {
    let n = candles.len();
    let mut out = vec![None; n];
    if period == 0 || n < 2 * period + 1 {
        return out;
    }

    let mut tr_s = 0.0;
    let mut plus_s = 0.0;
    let mut minus_s = 0.0;
    let mut dx_sum = 0.0;
    let mut adx = 0.0;

    for i in 1..n {
        let up = candles[i].high_f64() - candles[i - 1].high_f64();
        let down = candles[i - 1].low_f64() - candles[i].low_f64();
        let plus_dm = if up > down && up > 0.0 { up } else { 0.0 };
        let minus_dm = if down > up && down > 0.0 { down } else { 0.0 };
        let tr = true_range(&candles[i], &candles[i - 1]);

        if i <= period {
            tr_s += tr;
            plus_s += plus_dm;
            minus_s += minus_dm;
            if i < period {
                continue;
            }
        } else {
            tr_s = tr_s - tr_s / period as f64 + tr;
            plus_s = plus_s - plus_s / period as f64 + plus_dm;
            minus_s = minus_s - minus_s / period as f64 + minus_dm;
        }

        let dx = if tr_s > 0.0 {
            let plus_di = 100.0 * plus_s / tr_s;
            let minus_di = 100.0 * minus_s / tr_s;
            let di_sum = plus_di + minus_di;
            if di_sum > 0.0 {
                100.0 * (plus_di - minus_di).abs() / di_sum
            } else {
                0.0
            }
        } else {
            0.0
        };

        // DX values from bar `period` onward; ADX seeds after `period` of them
        let dx_index = i - period;
        if dx_index < period {
            dx_sum += dx;
            if dx_index == period - 1 {
                adx = dx_sum / period as f64;
                out[i] = finite(adx);
            }
        } else {
            adx = (adx * (period as f64 - 1.0) + dx) / period as f64;
            out[i] = finite(adx);
        }
    }
    out
}

/// Standard deviation of simple returns, annualized with 252 periods, in percent
fn annualized_volatility(closes: &[f64]) -> Option<f64> {
    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect();
    if returns.len() < 2 {
        return None;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    finite(var.sqrt() * 252f64.sqrt() * 100.0)
}

/// Trend strength 0-100 from average stacking, ADX and MACD side
fn trend_strength(
    close: f64,
    ema20: Option<f64>,
    ema50: Option<f64>,
    adx: Option<f64>,
    macd: Option<f64>,
    macd_signal: Option<f64>,
) -> f64 {
    let mut strength = 0.0;
    match (ema20, ema50) {
        (Some(fast), Some(slow)) if close > fast && fast > slow => strength += 40.0,
        (Some(fast), _) if close > fast => strength += 20.0,
        _ => {}
    }
    match adx {
        Some(adx) if adx > 25.0 => strength += 30.0,
        Some(adx) if adx > 20.0 => strength += 15.0,
        _ => {}
    }
    if let (Some(m), Some(s)) = (macd, macd_signal) {
        if m > s {
            strength += 30.0;
        }
    }
    f64::min(strength, 100.0)
}

/// Base technical score: trend strength blended with RSI moderation
fn base_score(trend_strength: f64, rsi: Option<f64>) -> f64 {
    let rsi_quality = match rsi {
        Some(rsi) => (100.0 - (rsi - 55.0).abs() * 2.5).clamp(0.0, 100.0),
        None => 50.0,
    };
    (trend_strength * 0.7 + rsi_quality * 0.3).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::prelude::FromPrimitive;
    use rust_decimal::Decimal;

    fn series_from_closes(closes: &[f64]) -> InstrumentSeries {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let candles = closes
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let close = Decimal::from_f64(*c).unwrap();
                Candle {
                    timestamp: start + Duration::days(i as i64),
                    open: close,
                    high: close + Decimal::ONE,
                    low: close - Decimal::ONE,
                    close,
                    volume: Decimal::from(1000 + i as i64),
                }
            })
            .collect();
        InstrumentSeries::new("TEST", candles)
    }

    #[test]
    fn test_sma_matches_manual_average() {
        let sma = calculate_sma(&[1.0, 2.0, 3.0, 4.0, 5.0], 3);
        assert_eq!(sma[1], None);
        assert_eq!(sma[2], Some(2.0));
        assert_eq!(sma[4], Some(4.0));
    }

    #[test]
    fn test_rsi_extremes() {
        let rising: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let rsi = calculate_rsi(&rising, 14);
        assert_eq!(rsi[13], None);
        assert_eq!(rsi[29], Some(100.0));

        let falling: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        let rsi = calculate_rsi(&falling, 14);
        assert!(rsi[29].unwrap() < 1.0);
    }

    #[test]
    fn test_snapshots_align_and_stay_finite() {
        let closes: Vec<f64> = (0..120)
            .map(|i| 100.0 + (i as f64 * 0.3).sin() * 5.0 + i as f64 * 0.2)
            .collect();
        let series = series_from_closes(&closes);
        let snaps = StandardIndicators.compute(&series);

        assert_eq!(snaps.len(), series.len());
        let last = snaps.last().unwrap();
        assert!(last.rsi.is_some());
        assert!(last.adx.is_some());
        assert!(last.atr.is_some());
        assert!(last.macd_hist.is_some());
        assert!(last.support.is_some());
        for snap in &snaps {
            let base = snap.base_score.unwrap();
            assert!((0.0..=100.0).contains(&base));
        }
        // Warmup bars carry unavailable values rather than zeros
        assert_eq!(snaps[3].rsi, None);
        assert_eq!(snaps[3].atr, None);
    }

    #[test]
    fn test_from_parts_rejects_misaligned_snapshots() {
        let series = series_from_closes(&[100.0, 101.0, 102.0]);
        let err = PreparedSeries::from_parts(
            "TEST".into(),
            series.candles.clone(),
            vec![IndicatorSnapshot::default()],
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::DataInsufficient);
    }
}
