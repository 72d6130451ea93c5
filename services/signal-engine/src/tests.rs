//! Integration tests for signal-engine

#[cfg(test)]
mod tests {
    use crate::backtest::{BacktestReport, TradeSimulator};
    use crate::brain::{HeuristicClassifier, Recommendation, ScoringPipeline};
    use crate::config::{EngineConfig, StopBasis};
    use crate::indicators::{PreparedSeries, StandardIndicators};
    use crate::types::{Candle, IndicatorSnapshot, InstrumentSeries};
    use crate::weights::{ActiveWeights, WeightVector};
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::prelude::FromPrimitive;
    use rust_decimal::Decimal;
    use std::sync::Arc;

    /// Deterministic zig-zag uptrend with periodic volume spikes
    fn wave_series(instrument: &str, bars: usize) -> PreparedSeries {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let candles: Vec<Candle> = (0..bars)
            .map(|i| {
                let t = i as f64;
                let close = 100.0 + 0.4 * t + 3.0 * (t / 4.0).sin();
                let open = close - 0.3 * (t / 3.0).cos();
                let d = |v: f64| Decimal::from_f64(v).unwrap().round_dp(4);
                Candle {
                    timestamp: start + Duration::days(i as i64),
                    open: d(open),
                    high: d(open.max(close) + 0.8),
                    low: d(open.min(close) - 0.8),
                    close: d(close),
                    volume: Decimal::from(if i % 7 == 0 { 4000 } else { 1000 }),
                }
            })
            .collect();
        PreparedSeries::prepare(&InstrumentSeries::new(instrument, candles), &StandardIndicators)
            .unwrap()
    }

    fn pipeline(config: &EngineConfig) -> ScoringPipeline {
        ScoringPipeline::new(config, Arc::new(HeuristicClassifier)).unwrap()
    }

    #[test]
    fn test_scoring_is_idempotent() {
        let config = EngineConfig::default();
        let pipeline = pipeline(&config);
        let series = wave_series("WAVE", 120);
        let weights = WeightVector::default();

        for index in [60, 90, 119] {
            let first = pipeline.score_at(&series, index, &weights).unwrap();
            let second = pipeline.score_at(&series, index, &weights).unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_scores_stay_in_range() {
        let config = EngineConfig::default();
        let pipeline = pipeline(&config);
        let series = wave_series("WAVE", 150);
        let weights = WeightVector::new(0.4, 0.1, 0.4, 0.1).unwrap();

        for index in (config.scoring.min_bars - 1)..series.len() {
            let signal = pipeline.score_at(&series, index, &weights).unwrap();
            for component in signal.components.as_array() {
                assert!((0.0..=100.0).contains(&component), "bar {}: {:?}", index, signal.components);
            }
            assert!((0.0..=100.0).contains(&signal.final_score));
            if !signal.is_valid {
                assert_eq!(signal.recommendation, Recommendation::Reject);
            }
        }
    }

    #[test]
    fn test_short_history_is_insufficient() {
        let config = EngineConfig::default();
        let series = wave_series("SHORT", 30);
        let err = pipeline(&config)
            .score_latest(&series, &WeightVector::default())
            .unwrap_err();
        assert_eq!(err.kind().as_str(), "data_insufficient");
    }

    #[test]
    fn test_failed_gate_rejects_despite_strong_components() {
        let config = EngineConfig::default();
        let pipeline = pipeline(&config);
        let mut series = wave_series("GATE", 60);

        // Strong base and RSI but only two of six sources confirm
        let last = series.len() - 1;
        series.snapshots[last] = IndicatorSnapshot {
            close: series.snapshots[last].close,
            rsi: Some(50.0),
            close_sma5: Some(1.0),
            base_score: Some(100.0),
            trend_strength: Some(100.0),
            ..Default::default()
        };

        let signal = pipeline.score_latest(&series, &WeightVector::default()).unwrap();
        assert!(!signal.is_valid);
        assert_eq!(signal.recommendation, Recommendation::Reject);
        assert_eq!(signal.components.confidence, 0.0);
        assert_eq!(signal.components.entry_timing, 0.0);
        assert!(signal
            .rejection_reasons
            .iter()
            .any(|r| r.contains("2/6")));
    }

    #[test]
    fn test_custom_source_list_changes_gate() {
        let mut config = EngineConfig::default();
        config.confirmation.sources = vec!["rsi_moderation".into(), "multi_timeframe".into()];
        config.confirmation.required_normal = 2;
        config.validate().unwrap();

        let mut series = wave_series("TWO", 60);
        let last = series.len() - 1;
        let close = series.snapshots[last].close;
        series.snapshots[last] = IndicatorSnapshot {
            close,
            rsi: Some(50.0),
            close_sma5: Some(close - 1.0),
            ..Default::default()
        };

        let signal = pipeline(&config)
            .score_latest(&series, &WeightVector::default())
            .unwrap();
        assert!(signal.is_valid);
        assert_eq!(signal.components.confirmation, 100.0);
    }

    #[test]
    fn test_weight_vector_json_round_trip() {
        let weights = WeightVector::new(0.1, 0.2, 0.3, 0.4).unwrap();
        let json = serde_json::to_string(&weights).unwrap();
        assert!(json.contains("entry_timing"));
        let back: WeightVector = serde_json::from_str(&json).unwrap();
        assert_eq!(back, weights);

        let invalid = r#"{"base":0.5,"confirmation":0.5,"confidence":0.5,"entry_timing":0.5}"#;
        assert!(serde_json::from_str::<WeightVector>(invalid).is_err());
    }

    #[test]
    fn test_backtest_report_json_round_trip() {
        let mut config = EngineConfig::default();
        config.simulator.stop_basis = StopBasis::Percent;
        config.simulator.entry_threshold = 50.0;
        let simulator = TradeSimulator::new(Arc::new(pipeline(&config)), config.simulator.clone());

        let universe = vec![wave_series("A", 160), wave_series("B", 20)];
        let report = simulator.run(&universe, &WeightVector::default());
        assert_eq!(report.skipped.len(), 1);

        let json = serde_json::to_string(&report).unwrap();
        let back: BacktestReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn test_backtest_is_deterministic() {
        let config = EngineConfig::default();
        let simulator = TradeSimulator::new(Arc::new(pipeline(&config)), config.simulator.clone());
        let universe = vec![wave_series("A", 160), wave_series("B", 140)];
        let weights = WeightVector::default();

        let first = simulator.run(&universe, &weights);
        let second = simulator.run(&universe, &weights);
        assert_eq!(first.stats, second.stats);
        assert_eq!(first.trades, second.trades);
        for trade in &first.trades {
            assert_eq!(trade.total_fraction(), Decimal::ONE);
        }
    }

    #[test]
    fn test_promotion_leaves_held_snapshots_intact() {
        let active = ActiveWeights::default();
        let held = active.snapshot();
        let next = WeightVector::new(0.4, 0.2, 0.2, 0.2).unwrap();

        let previous = active.promote(next);
        assert_eq!(*previous, WeightVector::default());
        assert_eq!(*held, WeightVector::default());
        assert_eq!(*active.snapshot(), next);
    }
}
