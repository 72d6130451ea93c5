//! Weighted integrator and the per-bar scoring pipeline

use std::sync::Arc;
use tracing::trace;

use crate::brain::classifier::{ConfidenceModel, FeatureVector};
use crate::brain::confirmation::ConfirmationAggregator;
use crate::brain::entry_timing::EntryTimingScorer;
use crate::brain::signal::{ComponentScores, ConfidenceLabel, IntegratedSignal, Recommendation};
use crate::config::{EngineConfig, RecommendationBands, ScoringConfig};
use crate::errors::{EngineError, Result};
use crate::indicators::PreparedSeries;
use crate::weights::WeightVector;

/// Fuses component scores with a weight vector
#[derive(Debug, Clone, Copy)]
pub struct WeightedIntegrator {
    bands: RecommendationBands,
    agreement_width: f64,
}

impl WeightedIntegrator {
    pub fn new(config: &ScoringConfig) -> Self {
        Self {
            bands: config.bands,
            agreement_width: config.agreement_width,
        }
    }

    /// Weighted sum of the clamped components, each used once at its 0-100 scale
    pub fn final_score(&self, weights: &WeightVector, components: &ComponentScores) -> f64 {
        let c = components.clamped();
        let score = weights.base() * c.base
            + weights.confirmation() * c.confirmation
            + weights.confidence() * c.confidence
            + weights.entry_timing() * c.entry_timing;
        score.clamp(0.0, 100.0)
    }

    pub fn recommend(&self, final_score: f64) -> Recommendation {
        if final_score >= self.bands.strong_buy_at {
            Recommendation::StrongBuy
        } else if final_score >= self.bands.buy_at {
            Recommendation::Buy
        } else if final_score >= self.bands.hold_at {
            Recommendation::Hold
        } else {
            Recommendation::Reject
        }
    }

    /// HIGH needs tight agreement and a fitted classifier
    pub fn label(&self, components: &ComponentScores, classifier_trained: bool) -> ConfidenceLabel {
        let spread = components.clamped().spread();
        if spread <= self.agreement_width && classifier_trained {
            ConfidenceLabel::High
        } else if spread <= 2.0 * self.agreement_width {
            ConfidenceLabel::Medium
        } else {
            ConfidenceLabel::Low
        }
    }
}

/// Scores one instrument at one bar from precomputed snapshots.
///
/// Pure: the same series, index and weights always give the same signal.
#[derive(Debug, Clone)]
pub struct ScoringPipeline {
    aggregator: ConfirmationAggregator,
    classifier: Arc<dyn ConfidenceModel>,
    timing: EntryTimingScorer,
    integrator: WeightedIntegrator,
    min_bars: usize,
    neutral_score: f64,
}

impl ScoringPipeline {
    pub fn new(config: &EngineConfig, classifier: Arc<dyn ConfidenceModel>) -> Result<Self> {
        Ok(Self {
            aggregator: ConfirmationAggregator::new(&config.confirmation)?,
            classifier,
            timing: EntryTimingScorer::new(config.scoring.entry_window),
            integrator: WeightedIntegrator::new(&config.scoring),
            min_bars: config.scoring.min_bars,
            neutral_score: config.scoring.neutral_score,
        })
    }

    pub fn min_bars(&self) -> usize {
        self.min_bars
    }

    pub fn classifier(&self) -> &dyn ConfidenceModel {
        self.classifier.as_ref()
    }

    pub fn integrator(&self) -> &WeightedIntegrator {
        &self.integrator
    }

    /// Classifier features at a bar
    pub fn features_at(&self, series: &PreparedSeries, index: usize) -> Option<FeatureVector> {
        series.snapshots.get(index).map(FeatureVector::from_snapshot)
    }

    /// Score the most recent bar
    pub fn score_latest(
        &self,
        series: &PreparedSeries,
        weights: &WeightVector,
    ) -> Result<IntegratedSignal> {
        if series.is_empty() {
            return Err(EngineError::insufficient(&series.instrument, "no bars"));
        }
        self.score_at(series, series.len() - 1, weights)
    }

    /// Score bar `index`, reading only bars up to and including it
    pub fn score_at(
        &self,
        series: &PreparedSeries,
        index: usize,
        weights: &WeightVector,
    ) -> Result<IntegratedSignal> {
        if index >= series.len() {
            return Err(EngineError::insufficient(
                &series.instrument,
                format!("bar {} beyond {} bars", index, series.len()),
            ));
        }
        if index + 1 < self.min_bars {
            return Err(EngineError::insufficient(
                &series.instrument,
                format!("{} bars, need {}", index + 1, self.min_bars),
            ));
        }

        let snap = &series.snapshots[index];
        let candle = &series.candles[index];
        let mut signal =
            IntegratedSignal::new(series.instrument.clone(), candle.timestamp, snap.close)
                .with_atr(snap.atr);

        let base = match snap.base_score {
            Some(score) => score,
            None => {
                signal = signal.with_rejection("Base score unavailable, using neutral");
                self.neutral_score
            }
        };

        let confirmation = self.aggregator.evaluate(snap);
        for vote in &confirmation.votes {
            if vote.confirmed {
                signal = signal.with_confirmation(vote.detail.clone());
            } else {
                signal = signal.with_rejection(vote.detail.clone());
            }
        }
        signal.is_valid = confirmation.is_valid;
        signal.classifier_trained = self.classifier.is_trained();

        if !confirmation.is_valid {
            // Gate failed: classifier and timing are not consulted
            signal = signal.with_rejection(format!(
                "Only {}/{} confirmations, {} required",
                confirmation.confirmed, confirmation.total, confirmation.required
            ));
            signal.components = ComponentScores {
                base,
                confirmation: confirmation.score,
                confidence: 0.0,
                entry_timing: 0.0,
            }
            .clamped();
            signal.final_score = self.integrator.final_score(weights, &signal.components);
            signal.recommendation = Recommendation::Reject;
            signal.confidence_label = ConfidenceLabel::Low;
            return Ok(signal);
        }

        let features = FeatureVector::from_snapshot(snap);
        let confidence = self.classifier.confidence(&features);
        if confidence > 65.0 {
            signal = signal.with_confirmation(format!("Confidence high: {:.0}%", confidence));
        } else if confidence < 40.0 {
            signal = signal.with_rejection(format!("Confidence low: {:.0}%", confidence));
        }

        let entry_timing = match self.timing.score(&series.candles[..=index]) {
            Some(timing) => {
                signal = signal.with_best_entry(timing.best_entry_price);
                timing.score()
            }
            None => self.neutral_score,
        };

        signal.components = ComponentScores {
            base,
            confirmation: confirmation.score,
            confidence,
            entry_timing,
        }
        .clamped();
        signal.final_score = self.integrator.final_score(weights, &signal.components);
        signal.recommendation = self.integrator.recommend(signal.final_score);
        signal.confidence_label = self
            .integrator
            .label(&signal.components, signal.classifier_trained);

        trace!(
            instrument = %signal.instrument,
            final_score = signal.final_score,
            recommendation = %signal.recommendation,
            "Scored bar"
        );
        Ok(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoringConfig;

    fn components(base: f64, confirmation: f64, confidence: f64, entry_timing: f64) -> ComponentScores {
        ComponentScores {
            base,
            confirmation,
            confidence,
            entry_timing,
        }
    }

    #[test]
    fn test_final_score_uses_native_scale() {
        let integrator = WeightedIntegrator::new(&ScoringConfig::default());
        let weights = WeightVector::default();
        let score = integrator.final_score(&weights, &components(80.0, 66.7, 60.0, 50.0));
        let expected = 0.25 * 80.0 + 0.25 * 66.7 + 0.30 * 60.0 + 0.20 * 50.0;
        assert!((score - expected).abs() < 1e-9);
        assert!(score < 100.0, "percent inputs must not saturate the score");
    }

    #[test]
    fn test_bands() {
        let integrator = WeightedIntegrator::new(&ScoringConfig::default());
        assert_eq!(integrator.recommend(59.9), Recommendation::Reject);
        assert_eq!(integrator.recommend(60.0), Recommendation::Hold);
        assert_eq!(integrator.recommend(75.0), Recommendation::Buy);
        assert_eq!(integrator.recommend(89.99), Recommendation::Buy);
        assert_eq!(integrator.recommend(90.0), Recommendation::StrongBuy);
    }

    #[test]
    fn test_high_label_needs_trained_classifier() {
        let integrator = WeightedIntegrator::new(&ScoringConfig::default());
        let agreeing = components(80.0, 83.0, 78.0, 85.0);
        assert_eq!(integrator.label(&agreeing, true), ConfidenceLabel::High);
        assert_eq!(integrator.label(&agreeing, false), ConfidenceLabel::Medium);

        let scattered = components(95.0, 33.0, 70.0, 50.0);
        assert_eq!(integrator.label(&scattered, true), ConfidenceLabel::Low);
    }
}
