//! Universe scanner
//!
//! Scores the latest bar of every instrument on a bounded pool of blocking
//! tasks. The weight vector is read once as a snapshot, so a promotion that
//! lands mid-scan does not mix two weight sets in one report.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::backtest::SkippedInstrument;
use crate::brain::{IntegratedSignal, ScoringPipeline};
use crate::errors::{EngineError, Result};
use crate::indicators::PreparedSeries;
use crate::weights::{ActiveWeights, WeightVector};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanReport {
    /// Ordered by final score, best first
    pub signals: Vec<IntegratedSignal>,
    pub skipped: Vec<SkippedInstrument>,
}

impl ScanReport {
    /// Signals at or above the entry threshold that passed the gate
    pub fn actionable(&self, threshold: f64) -> impl Iterator<Item = &IntegratedSignal> {
        self.signals.iter().filter(move |s| s.is_actionable(threshold))
    }
}

pub struct UniverseScanner {
    pipeline: Arc<ScoringPipeline>,
    workers: usize,
}

impl UniverseScanner {
    pub fn new(pipeline: Arc<ScoringPipeline>, workers: usize) -> Self {
        Self {
            pipeline,
            workers: workers.max(1),
        }
    }

    /// Scan with whatever weights are active when the scan starts
    pub async fn scan_active(
        &self,
        universe: Arc<Vec<PreparedSeries>>,
        active: &ActiveWeights,
    ) -> ScanReport {
        let weights = active.snapshot();
        self.scan(universe, weights).await
    }

    pub async fn scan(
        &self,
        universe: Arc<Vec<PreparedSeries>>,
        weights: Arc<WeightVector>,
    ) -> ScanReport {
        let results: Vec<(usize, Result<IntegratedSignal>)> = stream::iter(0..universe.len())
            .map(|i| {
                let pipeline = Arc::clone(&self.pipeline);
                let universe = Arc::clone(&universe);
                let weights = Arc::clone(&weights);
                async move {
                    let result = tokio::task::spawn_blocking(move || {
                        pipeline.score_latest(&universe[i], &weights)
                    })
                    .await
                    .unwrap_or_else(|e| Err(EngineError::Evaluation(e.to_string())));
                    (i, result)
                }
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let mut report = ScanReport::default();
        for (i, result) in results {
            let instrument = &universe[i].instrument;
            match result {
                Ok(signal) => report.signals.push(signal),
                Err(e) => {
                    warn!(instrument = %instrument, kind = %e.kind(), "Skipping instrument: {}", e);
                    report.skipped.push(SkippedInstrument {
                        instrument: instrument.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.signals.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.instrument.cmp(&b.instrument))
        });
        report.skipped.sort_by(|a, b| a.instrument.cmp(&b.instrument));

        info!(
            scored = report.signals.len(),
            skipped = report.skipped.len(),
            "Scan complete"
        );
        report
    }
}
