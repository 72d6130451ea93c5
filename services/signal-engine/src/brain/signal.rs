//! Integrated signals - output of the scoring pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Recommendation derived from the final score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    Reject,
    Hold,
    Buy,
    StrongBuy,
}

impl Recommendation {
    pub fn is_entry(&self) -> bool {
        matches!(self, Recommendation::Buy | Recommendation::StrongBuy)
    }
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Recommendation::Reject => "REJECT",
            Recommendation::Hold => "HOLD",
            Recommendation::Buy => "BUY",
            Recommendation::StrongBuy => "STRONG_BUY",
        };
        f.write_str(label)
    }
}

/// How much the components agree with each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceLabel {
    Low,
    Medium,
    High,
}

/// The four integrator operands, each on a 0-100 scale
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentScores {
    pub base: f64,
    pub confirmation: f64,
    pub confidence: f64,
    pub entry_timing: f64,
}

impl ComponentScores {
    /// Clamp every component into [0, 100]; non-finite values become 0
    pub fn clamped(self) -> Self {
        let clamp = |v: f64| if v.is_finite() { v.clamp(0.0, 100.0) } else { 0.0 };
        Self {
            base: clamp(self.base),
            confirmation: clamp(self.confirmation),
            confidence: clamp(self.confidence),
            entry_timing: clamp(self.entry_timing),
        }
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.base, self.confirmation, self.confidence, self.entry_timing]
    }

    /// Max minus min across components
    pub fn spread(&self) -> f64 {
        let values = self.as_array();
        let max = values.iter().cloned().fold(f64::MIN, f64::max);
        let min = values.iter().cloned().fold(f64::MAX, f64::min);
        max - min
    }
}

/// Fused signal for one instrument at one bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegratedSignal {
    pub instrument: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub components: ComponentScores,
    pub final_score: f64,
    pub recommendation: Recommendation,
    pub confidence_label: ConfidenceLabel,
    /// Confirmation gate outcome
    pub is_valid: bool,
    pub classifier_trained: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_entry_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atr: Option<f64>,
    pub confirmation_reasons: Vec<String>,
    pub rejection_reasons: Vec<String>,
}

impl IntegratedSignal {
    pub fn new(instrument: String, timestamp: DateTime<Utc>, price: f64) -> Self {
        Self {
            instrument,
            timestamp,
            price,
            components: ComponentScores {
                base: 0.0,
                confirmation: 0.0,
                confidence: 0.0,
                entry_timing: 0.0,
            },
            final_score: 0.0,
            recommendation: Recommendation::Reject,
            confidence_label: ConfidenceLabel::Low,
            is_valid: false,
            classifier_trained: false,
            best_entry_price: None,
            atr: None,
            confirmation_reasons: Vec::new(),
            rejection_reasons: Vec::new(),
        }
    }

    pub fn with_best_entry(mut self, price: f64) -> Self {
        self.best_entry_price = Some(price);
        self
    }

    pub fn with_atr(mut self, atr: Option<f64>) -> Self {
        self.atr = atr;
        self
    }

    pub fn with_confirmation(mut self, reason: impl Into<String>) -> Self {
        self.confirmation_reasons.push(reason.into());
        self
    }

    pub fn with_rejection(mut self, reason: impl Into<String>) -> Self {
        self.rejection_reasons.push(reason.into());
        self
    }

    /// Whether the simulator may open a position on this signal
    pub fn is_actionable(&self, entry_threshold: f64) -> bool {
        self.is_valid
            && self.recommendation != Recommendation::Reject
            && self.final_score >= entry_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_components_clamp_and_spread() {
        let scores = ComponentScores {
            base: 130.0,
            confirmation: -5.0,
            confidence: f64::NAN,
            entry_timing: 40.0,
        }
        .clamped();
        assert_eq!(scores.as_array(), [100.0, 0.0, 0.0, 40.0]);
        assert_eq!(scores.spread(), 100.0);
    }

    #[test]
    fn test_recommendation_labels_serialize_upper_case() {
        let json = serde_json::to_string(&Recommendation::StrongBuy).unwrap();
        assert_eq!(json, "\"STRONG_BUY\"");
        assert_eq!(Recommendation::Hold.to_string(), "HOLD");
        assert!(Recommendation::Buy.is_entry());
        assert!(!Recommendation::Hold.is_entry());
    }
}
