//! Confidence classifier
//!
//! Two implementations of [`ConfidenceModel`], chosen once at construction:
//! a trained logistic model, or a deterministic feature heuristic used until
//! enough trade history exists to fit one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

use crate::errors::{EngineError, Result};
use crate::types::IndicatorSnapshot;

/// Samples needed before a model is fit
pub const MIN_TRAINING_SAMPLES: usize = 50;

/// Profit (percent) above which a historical trade counts as a success
pub const SUCCESS_PROFIT_PCT: f64 = 2.0;

const FEATURES: usize = 7;
const LEARNING_RATE: f64 = 0.1;
const EPOCHS: usize = 500;
const L2_PENALTY: f64 = 0.01;

/// Engineered classifier input. Unavailable indicators take neutral values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub rsi: f64,
    pub macd: f64,
    pub adx: f64,
    pub volume_ratio: f64,
    pub trend_strength: f64,
    pub atr_pct: f64,
    pub volatility: f64,
}

impl Default for FeatureVector {
    fn default() -> Self {
        Self {
            rsi: 50.0,
            macd: 0.0,
            adx: 0.0,
            volume_ratio: 1.0,
            trend_strength: 50.0,
            atr_pct: 2.0,
            volatility: 0.0,
        }
    }
}

impl FeatureVector {
    pub fn from_snapshot(snap: &IndicatorSnapshot) -> Self {
        let neutral = Self::default();
        Self {
            rsi: snap.rsi.unwrap_or(neutral.rsi),
            macd: snap.macd.unwrap_or(neutral.macd),
            adx: snap.adx.unwrap_or(neutral.adx),
            volume_ratio: snap.volume_ratio().unwrap_or(neutral.volume_ratio),
            trend_strength: snap.trend_strength.unwrap_or(neutral.trend_strength),
            atr_pct: snap.atr_pct().unwrap_or(neutral.atr_pct),
            volatility: snap.volatility.unwrap_or(neutral.volatility),
        }
    }

    pub fn as_array(&self) -> [f64; FEATURES] {
        [
            self.rsi,
            self.macd,
            self.adx,
            self.volume_ratio,
            self.trend_strength,
            self.atr_pct,
            self.volatility,
        ]
    }
}

/// One labelled historical trade
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingSample {
    pub features: FeatureVector,
    pub profit_pct: f64,
}

impl TrainingSample {
    pub fn is_success(&self) -> bool {
        self.profit_pct > SUCCESS_PROFIT_PCT
    }
}

/// Capability shared by the trained model and the fallback heuristic
pub trait ConfidenceModel: Send + Sync + std::fmt::Debug {
    /// Confidence in [0, 100]
    fn confidence(&self, features: &FeatureVector) -> f64;

    /// Whether the value comes from a fitted model
    fn is_trained(&self) -> bool;

    fn name(&self) -> &'static str;
}

/// Deterministic fallback: 0.4 oscillator + 0.4 volume + 0.2 trend
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicClassifier;

impl HeuristicClassifier {
    /// 1.0 at RSI 50, falling linearly to 0.0 at 0 and 100
    fn oscillator_quality(rsi: f64) -> f64 {
        (1.0 - (rsi - 50.0).abs() / 50.0).clamp(0.0, 1.0)
    }

    /// Saturates at twice average volume
    fn volume_quality(volume_ratio: f64) -> f64 {
        (volume_ratio / 2.0).clamp(0.0, 1.0)
    }

    fn trend_quality(trend_strength: f64) -> f64 {
        (trend_strength / 100.0).clamp(0.0, 1.0)
    }
}

impl ConfidenceModel for HeuristicClassifier {
    fn confidence(&self, f: &FeatureVector) -> f64 {
        let score = 0.4 * Self::oscillator_quality(f.rsi)
            + 0.4 * Self::volume_quality(f.volume_ratio)
            + 0.2 * Self::trend_quality(f.trend_strength);
        (score * 100.0).clamp(0.0, 100.0)
    }

    fn is_trained(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "heuristic"
    }
}

/// Standardized logistic regression over [`FeatureVector`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub means: [f64; FEATURES],
    pub scales: [f64; FEATURES],
    pub coefficients: [f64; FEATURES],
    pub intercept: f64,
    pub samples: usize,
    pub positive_rate: f64,
    pub trained_at: DateTime<Utc>,
}

impl LogisticModel {
    /// Fit by batch gradient descent with a small L2 penalty
    pub fn fit(samples: &[TrainingSample]) -> Result<Self> {
        if samples.len() < MIN_TRAINING_SAMPLES {
            return Err(EngineError::insufficient(
                "training corpus",
                format!(
                    "{} samples, need at least {}",
                    samples.len(),
                    MIN_TRAINING_SAMPLES
                ),
            ));
        }

        let rows: Vec<[f64; FEATURES]> = samples.iter().map(|s| s.features.as_array()).collect();
        let labels: Vec<f64> = samples
            .iter()
            .map(|s| if s.is_success() { 1.0 } else { 0.0 })
            .collect();
        let n = rows.len() as f64;

        let mut means = [0.0; FEATURES];
        let mut scales = [1.0; FEATURES];
        for j in 0..FEATURES {
            means[j] = rows.iter().map(|r| r[j]).sum::<f64>() / n;
            let var = rows.iter().map(|r| (r[j] - means[j]).powi(2)).sum::<f64>() / n;
            // Constant columns keep unit scale so they standardize to zero
            if var.sqrt() > 1e-12 {
                scales[j] = var.sqrt();
            }
        }

        let standardized: Vec<[f64; FEATURES]> = rows
            .iter()
            .map(|r| {
                let mut z = [0.0; FEATURES];
                for j in 0..FEATURES {
                    z[j] = (r[j] - means[j]) / scales[j];
                }
                z
            })
            .collect();

        let mut coefficients = [0.0; FEATURES];
        let mut intercept = 0.0;
        for _ in 0..EPOCHS {
            let mut grad = [0.0; FEATURES];
            let mut grad_intercept = 0.0;
            for (z, y) in standardized.iter().zip(labels.iter()) {
                let err = sigmoid(dot(&coefficients, z) + intercept) - y;
                for j in 0..FEATURES {
                    grad[j] += err * z[j];
                }
                grad_intercept += err;
            }
            for j in 0..FEATURES {
                coefficients[j] -= LEARNING_RATE * (grad[j] / n + L2_PENALTY * coefficients[j]);
            }
            intercept -= LEARNING_RATE * grad_intercept / n;
        }

        let positive_rate = labels.iter().sum::<f64>() / n;
        info!(
            samples = samples.len(),
            positive_rate,
            "Fitted confidence model"
        );

        Ok(Self {
            means,
            scales,
            coefficients,
            intercept,
            samples: samples.len(),
            positive_rate,
            trained_at: Utc::now(),
        })
    }

    /// Probability of a successful trade
    pub fn probability(&self, features: &FeatureVector) -> f64 {
        let x = features.as_array();
        let mut z = [0.0; FEATURES];
        for j in 0..FEATURES {
            let value = if x[j].is_finite() { x[j] } else { self.means[j] };
            z[j] = (value - self.means[j]) / self.scales[j];
        }
        let p = sigmoid(dot(&self.coefficients, &z) + self.intercept);
        if p.is_finite() {
            p
        } else {
            0.5
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(self)?).await?;
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).await.map_err(|e| {
            EngineError::ClassifierUnavailable(format!("{}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            EngineError::ClassifierUnavailable(format!("{}: {}", path.display(), e))
        })
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn dot(a: &[f64; FEATURES], b: &[f64; FEATURES]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Classifier backed by a fitted model
#[derive(Debug, Clone)]
pub struct TrainedClassifier {
    model: LogisticModel,
}

impl TrainedClassifier {
    pub fn new(model: LogisticModel) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &LogisticModel {
        &self.model
    }
}

impl ConfidenceModel for TrainedClassifier {
    fn confidence(&self, features: &FeatureVector) -> f64 {
        (self.model.probability(features) * 100.0).clamp(0.0, 100.0)
    }

    fn is_trained(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "logistic"
    }
}

/// Load a trained model if one is available, otherwise use the heuristic
pub async fn load_classifier(path: Option<&Path>) -> Arc<dyn ConfidenceModel> {
    let Some(path) = path else {
        return Arc::new(HeuristicClassifier);
    };
    match LogisticModel::load(path).await {
        Ok(model) => {
            info!(
                "Loaded confidence model from {} ({} samples)",
                path.display(),
                model.samples
            );
            Arc::new(TrainedClassifier::new(model))
        }
        Err(e) => {
            warn!(kind = %e.kind(), "{}; using heuristic confidence", e);
            Arc::new(HeuristicClassifier)
        }
    }
}
