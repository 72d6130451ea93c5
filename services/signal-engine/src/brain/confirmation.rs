//! Multi-source confirmation aggregator
//!
//! Each source casts one independent vote from the bar's indicator snapshot.
//! The number of votes required adapts to the volatility regime.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::config::ConfirmationConfig;
use crate::errors::{EngineError, Result};
use crate::types::IndicatorSnapshot;

/// Volatility regime derived from ATR as a percent of price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolatilityRegime {
    Low,
    Normal,
    High,
}

/// A named vote source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationSource {
    /// RSI strictly between 30 and 70
    RsiModeration,
    /// Volume above 1.5x its 20 bar average
    VolumeConfirmation,
    /// Close above the long average with ADX above 25
    TrendAlignment,
    /// Close 1-5% above 20 bar support
    PriceAction,
    /// Close above the 5 bar average close
    MultiTimeframe,
    /// Rising positive MACD histogram, MACD over signal, or 5 bar momentum over 1%
    MacdMomentum,
}

impl ConfirmationSource {
    pub fn name(&self) -> &'static str {
        match self {
            ConfirmationSource::RsiModeration => "rsi_moderation",
            ConfirmationSource::VolumeConfirmation => "volume_confirmation",
            ConfirmationSource::TrendAlignment => "trend_alignment",
            ConfirmationSource::PriceAction => "price_action",
            ConfirmationSource::MultiTimeframe => "multi_timeframe",
            ConfirmationSource::MacdMomentum => "macd_momentum",
        }
    }

    /// Cast this source's vote. Unavailable inputs never confirm.
    pub fn evaluate(&self, snap: &IndicatorSnapshot) -> Vote {
        let close = snap.close;
        let (confirmed, detail) = match self {
            ConfirmationSource::RsiModeration => match snap.rsi {
                Some(rsi) if rsi > 30.0 && rsi < 70.0 => (true, format!("RSI moderate ({:.1})", rsi)),
                Some(rsi) => (false, format!("RSI extreme ({:.1})", rsi)),
                None => (false, "RSI unavailable".to_string()),
            },
            ConfirmationSource::VolumeConfirmation => match snap.volume_ratio() {
                Some(ratio) if ratio > 1.5 => (true, format!("Volume {:.1}x average", ratio)),
                Some(ratio) => (false, format!("Volume only {:.1}x average", ratio)),
                None => (false, "Volume average unavailable".to_string()),
            },
            ConfirmationSource::TrendAlignment => match (snap.long_ma, snap.adx) {
                (Some(ma), Some(adx)) if close > ma && adx > 25.0 => {
                    (true, format!("Above long average with ADX {:.1}", adx))
                }
                (Some(ma), Some(adx)) => (
                    false,
                    format!("Trend not aligned (close/avg {:.3}, ADX {:.1})", close / ma, adx),
                ),
                _ => (false, "Trend inputs unavailable".to_string()),
            },
            ConfirmationSource::PriceAction => match snap.support {
                Some(support) if support > 0.0 => {
                    let distance = (close - support) / support * 100.0;
                    if (1.0..=5.0).contains(&distance) {
                        (true, format!("{:.1}% above support", distance))
                    } else {
                        (false, format!("{:.1}% from support", distance))
                    }
                }
                _ => (false, "Support unavailable".to_string()),
            },
            ConfirmationSource::MultiTimeframe => match snap.close_sma5 {
                Some(avg) if close > avg => (true, "Above short-term average".to_string()),
                Some(_) => (false, "Below short-term average".to_string()),
                None => (false, "Short-term average unavailable".to_string()),
            },
            ConfirmationSource::MacdMomentum => macd_vote(snap),
        };
        Vote {
            source: *self,
            confirmed,
            detail,
        }
    }
}

fn macd_vote(snap: &IndicatorSnapshot) -> (bool, String) {
    if let (Some(hist), Some(prev)) = (snap.macd_hist, snap.prev_macd_hist) {
        if hist > 0.0 && hist > prev {
            return (true, "MACD histogram positive and rising".to_string());
        }
    }
    if let (Some(macd), Some(signal)) = (snap.macd, snap.macd_signal) {
        if macd > signal {
            return (true, "MACD above signal".to_string());
        }
    }
    match snap.momentum_5 {
        Some(m) if m > 1.0 => (true, format!("5-bar momentum {:.1}%", m)),
        Some(m) => (false, format!("Weak momentum ({:.1}%)", m)),
        None => (false, "Momentum inputs unavailable".to_string()),
    }
}

impl FromStr for ConfirmationSource {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rsi_moderation" => Ok(ConfirmationSource::RsiModeration),
            "volume_confirmation" => Ok(ConfirmationSource::VolumeConfirmation),
            "trend_alignment" => Ok(ConfirmationSource::TrendAlignment),
            "price_action" => Ok(ConfirmationSource::PriceAction),
            "multi_timeframe" => Ok(ConfirmationSource::MultiTimeframe),
            "macd_momentum" => Ok(ConfirmationSource::MacdMomentum),
            other => Err(EngineError::config(format!(
                "unknown confirmation source: {}",
                other
            ))),
        }
    }
}

/// One source's vote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub source: ConfirmationSource,
    pub confirmed: bool,
    pub detail: String,
}

/// Aggregated confirmation for one bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationResult {
    pub confirmed: usize,
    pub total: usize,
    pub required: usize,
    pub regime: VolatilityRegime,
    /// confirmed / total x 100
    pub score: f64,
    pub is_valid: bool,
    pub votes: Vec<Vote>,
}

impl ConfirmationResult {
    pub fn confirmed_sources(&self) -> Vec<&'static str> {
        self.votes
            .iter()
            .filter(|v| v.confirmed)
            .map(|v| v.source.name())
            .collect()
    }

    pub fn rejected_sources(&self) -> Vec<&'static str> {
        self.votes
            .iter()
            .filter(|v| !v.confirmed)
            .map(|v| v.source.name())
            .collect()
    }
}

/// Counts votes from the configured sources
#[derive(Debug, Clone)]
pub struct ConfirmationAggregator {
    sources: Vec<ConfirmationSource>,
    low_volatility_atr_pct: f64,
    high_volatility_atr_pct: f64,
    required_low: usize,
    required_normal: usize,
    required_high: usize,
}

impl ConfirmationAggregator {
    pub fn new(config: &ConfirmationConfig) -> Result<Self> {
        let sources = config
            .sources
            .iter()
            .map(|name| name.parse())
            .collect::<Result<Vec<ConfirmationSource>>>()?;
        if sources.is_empty() {
            return Err(EngineError::config("at least one confirmation source is required"));
        }
        Ok(Self {
            sources,
            low_volatility_atr_pct: config.low_volatility_atr_pct,
            high_volatility_atr_pct: config.high_volatility_atr_pct,
            required_low: config.required_low,
            required_normal: config.required_normal,
            required_high: config.required_high,
        })
    }

    pub fn sources(&self) -> &[ConfirmationSource] {
        &self.sources
    }

    /// Unavailable ATR counts as the normal regime
    pub fn regime(&self, snap: &IndicatorSnapshot) -> VolatilityRegime {
        match snap.atr_pct() {
            Some(pct) if pct < self.low_volatility_atr_pct => VolatilityRegime::Low,
            Some(pct) if pct < self.high_volatility_atr_pct => VolatilityRegime::Normal,
            Some(_) => VolatilityRegime::High,
            None => VolatilityRegime::Normal,
        }
    }

    /// Votes needed in a regime, never more than the number of sources
    pub fn required_for(&self, regime: VolatilityRegime) -> usize {
        let required = match regime {
            VolatilityRegime::Low => self.required_low,
            VolatilityRegime::Normal => self.required_normal,
            VolatilityRegime::High => self.required_high,
        };
        required.min(self.sources.len())
    }

    pub fn evaluate(&self, snap: &IndicatorSnapshot) -> ConfirmationResult {
        let votes: Vec<Vote> = self.sources.iter().map(|s| s.evaluate(snap)).collect();
        let confirmed = votes.iter().filter(|v| v.confirmed).count();
        let total = votes.len();
        let regime = self.regime(snap);
        let required = self.required_for(regime);

        ConfirmationResult {
            confirmed,
            total,
            required,
            regime,
            score: confirmed as f64 / total as f64 * 100.0,
            is_valid: confirmed >= required,
            votes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// ATR 2% of price: the normal regime
    fn normal_regime_snapshot() -> IndicatorSnapshot {
        IndicatorSnapshot {
            close: 100.0,
            atr: Some(2.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_two_of_six_fails_normal_gate() {
        let agg = ConfirmationAggregator::new(&ConfirmationConfig::default()).unwrap();
        let snap = IndicatorSnapshot {
            rsi: Some(50.0),
            close_sma5: Some(99.0),
            ..normal_regime_snapshot()
        };

        let result = agg.evaluate(&snap);
        assert_eq!(result.regime, VolatilityRegime::Normal);
        assert_eq!(result.confirmed, 2);
        assert_eq!(result.total, 6);
        assert_eq!(result.required, 4);
        assert!(!result.is_valid);
        assert!((result.score - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(result.confirmed_sources(), vec!["rsi_moderation", "multi_timeframe"]);
    }

    #[test]
    fn test_regime_thresholds() {
        let agg = ConfirmationAggregator::new(&ConfirmationConfig::default()).unwrap();
        let with_atr = |atr| IndicatorSnapshot {
            close: 100.0,
            atr,
            ..Default::default()
        };
        assert_eq!(agg.regime(&with_atr(Some(1.0))), VolatilityRegime::Low);
        assert_eq!(agg.regime(&with_atr(Some(2.9))), VolatilityRegime::Normal);
        assert_eq!(agg.regime(&with_atr(Some(3.0))), VolatilityRegime::High);
        assert_eq!(agg.regime(&with_atr(None)), VolatilityRegime::Normal);
        assert_eq!(agg.required_for(VolatilityRegime::Low), 3);
        assert_eq!(agg.required_for(VolatilityRegime::High), 5);
    }

    #[test]
    fn test_required_clamped_to_source_count() {
        let config = ConfirmationConfig {
            sources: vec!["rsi_moderation".into(), "multi_timeframe".into()],
            ..Default::default()
        };
        let agg = ConfirmationAggregator::new(&config).unwrap();
        assert_eq!(agg.required_for(VolatilityRegime::High), 2);
    }

    #[test]
    fn test_unknown_source_is_configuration_error() {
        let config = ConfirmationConfig {
            sources: vec!["astrology".into()],
            ..Default::default()
        };
        let err = ConfirmationAggregator::new(&config).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Configuration);
    }

    #[test]
    fn test_macd_falls_back_to_momentum() {
        let snap = IndicatorSnapshot {
            close: 100.0,
            momentum_5: Some(1.5),
            ..Default::default()
        };
        assert!(ConfirmationSource::MacdMomentum.evaluate(&snap).confirmed);

        let flat = IndicatorSnapshot {
            momentum_5: Some(0.2),
            ..snap
        };
        assert!(!ConfirmationSource::MacdMomentum.evaluate(&flat).confirmed);
    }
}
