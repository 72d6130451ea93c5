//! Integration weights, the active snapshot used by live scoring, and the
//! persisted best-weights record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio::fs;
use tracing::{debug, info};

use crate::errors::{EngineError, Result};

/// Allowed deviation of the component sum from 1.0
pub const SIMPLEX_TOLERANCE: f64 = 1e-6;

/// Number of weighted components
pub const COMPONENTS: usize = 4;

/// Four non-negative weights on the unit simplex.
///
/// Order: base, confirmation, confidence, entry_timing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawWeights", into = "RawWeights")]
pub struct WeightVector {
    components: [f64; COMPONENTS],
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RawWeights {
    base: f64,
    confirmation: f64,
    confidence: f64,
    entry_timing: f64,
}

impl TryFrom<RawWeights> for WeightVector {
    type Error = EngineError;

    fn try_from(raw: RawWeights) -> Result<Self> {
        WeightVector::new(raw.base, raw.confirmation, raw.confidence, raw.entry_timing)
    }
}

impl From<WeightVector> for RawWeights {
    fn from(w: WeightVector) -> Self {
        RawWeights {
            base: w.base(),
            confirmation: w.confirmation(),
            confidence: w.confidence(),
            entry_timing: w.entry_timing(),
        }
    }
}

impl WeightVector {
    /// Validated constructor: every component finite and >= 0, sum 1 ± 1e-6
    pub fn new(base: f64, confirmation: f64, confidence: f64, entry_timing: f64) -> Result<Self> {
        Self::from_array([base, confirmation, confidence, entry_timing])
    }

    pub fn from_array(components: [f64; COMPONENTS]) -> Result<Self> {
        if let Some(bad) = components.iter().find(|c| !c.is_finite() || **c < 0.0) {
            return Err(EngineError::config(format!(
                "weight component must be finite and non-negative, got {}",
                bad
            )));
        }
        let sum: f64 = components.iter().sum();
        if (sum - 1.0).abs() > SIMPLEX_TOLERANCE {
            return Err(EngineError::config(format!(
                "weights must sum to 1.0, got {:.6}",
                sum
            )));
        }
        Ok(Self { components })
    }

    /// Project arbitrary raw values onto the simplex.
    ///
    /// Negative and non-finite entries count as zero; an all-zero input maps
    /// to the uniform vector.
    pub fn normalized(raw: [f64; COMPONENTS]) -> Self {
        let cleaned = raw.map(|c| if c.is_finite() && c > 0.0 { c } else { 0.0 });
        let sum: f64 = cleaned.iter().sum();
        if sum <= f64::EPSILON {
            return Self {
                components: [1.0 / COMPONENTS as f64; COMPONENTS],
            };
        }
        let mut components = cleaned.map(|c| c / sum);
        // Push rounding residue into the largest component so the sum is exact
        // to within floating point of 1.0.
        let residue = 1.0 - components.iter().sum::<f64>();
        let largest = largest_index(&components);
        components[largest] = (components[largest] + residue).max(0.0);
        Self { components }
    }

    pub fn base(&self) -> f64 {
        self.components[0]
    }

    pub fn confirmation(&self) -> f64 {
        self.components[1]
    }

    pub fn confidence(&self) -> f64 {
        self.components[2]
    }

    pub fn entry_timing(&self) -> f64 {
        self.components[3]
    }

    pub fn as_array(&self) -> [f64; COMPONENTS] {
        self.components
    }

    pub fn sum(&self) -> f64 {
        self.components.iter().sum()
    }
}

impl Default for WeightVector {
    /// Hand-tuned starting point used before any optimization run
    fn default() -> Self {
        Self {
            components: [0.25, 0.25, 0.30, 0.20],
        }
    }
}

impl std::fmt::Display for WeightVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "base={:.3} confirmation={:.3} confidence={:.3} entry_timing={:.3}",
            self.base(),
            self.confirmation(),
            self.confidence(),
            self.entry_timing()
        )
    }
}

fn largest_index(values: &[f64; COMPONENTS]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

/// Inclusive search range for one weight component
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentBounds {
    pub min: f64,
    pub max: f64,
}

/// Per-component search space for the optimizer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightBounds {
    #[serde(default = "default_component_bounds")]
    pub base: ComponentBounds,
    #[serde(default = "default_component_bounds")]
    pub confirmation: ComponentBounds,
    #[serde(default = "default_component_bounds")]
    pub confidence: ComponentBounds,
    #[serde(default = "default_component_bounds")]
    pub entry_timing: ComponentBounds,
}

impl Default for WeightBounds {
    fn default() -> Self {
        Self {
            base: default_component_bounds(),
            confirmation: default_component_bounds(),
            confidence: default_component_bounds(),
            entry_timing: default_component_bounds(),
        }
    }
}

fn default_component_bounds() -> ComponentBounds {
    ComponentBounds { min: 0.10, max: 0.40 }
}

impl WeightBounds {
    pub fn as_array(&self) -> [ComponentBounds; COMPONENTS] {
        [self.base, self.confirmation, self.confidence, self.entry_timing]
    }

    /// Bounds must be ordered, inside [0, 1], and admit at least one simplex point
    pub fn validate(&self) -> Result<()> {
        let bounds = self.as_array();
        for b in &bounds {
            if !(b.min.is_finite() && b.max.is_finite()) || b.min < 0.0 || b.max > 1.0 || b.min > b.max {
                return Err(EngineError::config(format!(
                    "invalid weight bounds [{}, {}]",
                    b.min, b.max
                )));
            }
        }
        let min_sum: f64 = bounds.iter().map(|b| b.min).sum();
        let max_sum: f64 = bounds.iter().map(|b| b.max).sum();
        if min_sum > 1.0 + SIMPLEX_TOLERANCE || max_sum < 1.0 - SIMPLEX_TOLERANCE {
            return Err(EngineError::config(format!(
                "weight bounds cannot sum to 1.0 (min sum {:.3}, max sum {:.3})",
                min_sum, max_sum
            )));
        }
        Ok(())
    }

    /// Scale onto the simplex, pinning components that leave their range.
    ///
    /// Each round pins the side (above max or below min) with the larger total
    /// violation and redistributes what is left over the free components in
    /// proportion to their raw values. Feasible bounds settle in at most
    /// `COMPONENTS` rounds.
    pub fn project(&self, raw: [f64; COMPONENTS]) -> WeightVector {
        let bounds = self.as_array();
        let shape = WeightVector::normalized(raw).as_array();
        let mut pinned: [Option<f64>; COMPONENTS] = [None; COMPONENTS];

        for _ in 0..=COMPONENTS {
            let remaining = 1.0 - pinned.iter().flatten().sum::<f64>();
            let free: Vec<usize> = (0..COMPONENTS).filter(|i| pinned[*i].is_none()).collect();
            if free.is_empty() {
                break;
            }
            let free_mass: f64 = free.iter().map(|i| shape[*i]).sum();

            let mut candidate = [0.0; COMPONENTS];
            for i in 0..COMPONENTS {
                candidate[i] = match pinned[i] {
                    Some(v) => v,
                    None if free_mass > f64::EPSILON => remaining * shape[i] / free_mass,
                    None => remaining / free.len() as f64,
                };
            }

            let over: f64 = free.iter().map(|i| (candidate[*i] - bounds[*i].max).max(0.0)).sum();
            let under: f64 = free.iter().map(|i| (bounds[*i].min - candidate[*i]).max(0.0)).sum();
            if over <= 0.0 && under <= 0.0 {
                return WeightVector::normalized(candidate);
            }
            for i in free {
                if over >= under && candidate[i] > bounds[i].max {
                    pinned[i] = Some(bounds[i].max);
                } else if over < under && candidate[i] < bounds[i].min {
                    pinned[i] = Some(bounds[i].min);
                }
            }
        }

        WeightVector::normalized(pinned.map(|v| v.unwrap_or(0.0)))
    }
}

/// Active weight snapshot read by live scoring.
///
/// Readers take an `Arc` to an immutable vector; promotion replaces the
/// whole pointer under the write lock, so no reader ever sees a partial update.
#[derive(Debug, Clone)]
pub struct ActiveWeights {
    inner: Arc<RwLock<Arc<WeightVector>>>,
}

impl ActiveWeights {
    pub fn new(initial: WeightVector) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<WeightVector> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Atomically replace the active vector, returning the previous one
    pub fn promote(&self, next: WeightVector) -> Arc<WeightVector> {
        let next = Arc::new(next);
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let previous = std::mem::replace(&mut *guard, next);
        info!("Promoted active weights: {}", guard);
        previous
    }
}

impl Default for ActiveWeights {
    fn default() -> Self {
        Self::new(WeightVector::default())
    }
}

/// Persisted result of an optimization run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestWeightsRecord {
    pub best_weights: WeightVector,
    pub best_fitness: f64,
    pub fitness_metric: String,
    pub generations_run: usize,
    pub fitness_history: Vec<f64>,
    pub recorded_at: DateTime<Utc>,
}

impl BestWeightsRecord {
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).await?;
        debug!("Wrote best weights to {}", path.display());
        Ok(())
    }

    /// Load a record; a file holding invalid weights is a configuration error
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).await?;
        serde_json::from_str(&raw).map_err(|e| {
            EngineError::config(format!("invalid weights record {}: {}", path.display(), e))
        })
    }
}
