//! Portfolio allocation - Kelly sizing, risk parity and correlation penalty

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backtest::{SummaryStats, TradeSimulator};
use crate::config::PortfolioConfig;
use crate::errors::{EngineError, Result};
use crate::indicators::PreparedSeries;
use crate::weights::WeightVector;

/// Close-to-close returns used for pairwise correlation
pub const CORRELATION_LOOKBACK: usize = 60;

/// A qualifying instrument with its trade statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationCandidate {
    pub instrument: String,
    /// Fraction of winning trades
    pub win_rate: f64,
    /// Average winning trade, percent
    pub avg_win: f64,
    /// Average losing trade magnitude, percent
    pub avg_loss: f64,
    /// Return volatility used to scale risk contributions
    pub volatility: f64,
}

impl AllocationCandidate {
    pub fn from_stats(instrument: impl Into<String>, stats: &SummaryStats, volatility: f64) -> Self {
        Self {
            instrument: instrument.into(),
            win_rate: stats.win_rate,
            avg_win: stats.avg_win_pct,
            avg_loss: stats.avg_loss_pct,
            volatility,
        }
    }
}

/// Sized position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioPosition {
    pub instrument: String,
    /// Share of total capital
    pub capital_fraction: f64,
    /// `capital_fraction x total capital`
    pub dollar_risk: Decimal,
    /// Sub-Kelly fraction before risk parity and penalties
    pub kelly_fraction: f64,
}

/// A candidate that received no allocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedCandidate {
    pub instrument: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub positions: Vec<PortfolioPosition>,
    pub dropped: Vec<DroppedCandidate>,
    /// Sum of capital fractions; never above the configured maximum
    pub total_fraction: f64,
    /// Pairs above the correlation threshold, with their correlation
    pub correlated_pairs: Vec<(String, String, f64)>,
}

/// Symmetric correlation matrix indexed like the candidate list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationMatrix {
    values: Vec<Vec<f64>>,
}

impl CorrelationMatrix {
    pub fn new(values: Vec<Vec<f64>>) -> Result<Self> {
        let n = values.len();
        if values.iter().any(|row| row.len() != n) {
            return Err(EngineError::config("correlation matrix must be square"));
        }
        Ok(Self { values })
    }

    pub fn identity(n: usize) -> Self {
        let values = (0..n)
            .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
            .collect();
        Self { values }
    }

    /// Pearson correlation of each pair of return series over their shared most recent window
    pub fn from_returns(returns: &[Vec<f64>]) -> Self {
        let n = returns.len();
        let mut values = vec![vec![0.0; n]; n];
        for i in 0..n {
            values[i][i] = 1.0;
            for j in (i + 1)..n {
                let rho = pearson(&returns[i], &returns[j]);
                values[i][j] = rho;
                values[j][i] = rho;
            }
        }
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values
            .get(i)
            .and_then(|row| row.get(j))
            .copied()
            .filter(|v| v.is_finite())
            .unwrap_or(0.0)
    }
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let (a, b) = (&a[a.len() - n..], &b[b.len() - n..]);
    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for k in 0..n {
        let da = a[k] - mean_a;
        let db = b[k] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    let denom = (var_a * var_b).sqrt();
    if denom > 0.0 {
        (cov / denom).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Raw Kelly fraction `(p*b - (1-p)) / b`, `None` when undefined
pub fn kelly_fraction(win_rate: f64, avg_win: f64, avg_loss: f64) -> Option<f64> {
    if !(avg_win > 0.0 && avg_loss > 0.0) || !(0.0..=1.0).contains(&win_rate) {
        return None;
    }
    let b = avg_win / avg_loss;
    let f = (win_rate * b - (1.0 - win_rate)) / b;
    f.is_finite().then_some(f)
}

/// Sizes positions from trade statistics
#[derive(Debug, Clone)]
pub struct PortfolioAllocator {
    config: PortfolioConfig,
}

impl PortfolioAllocator {
    pub fn new(config: PortfolioConfig) -> Self {
        Self { config }
    }

    /// Allocate capital across candidates. `correlation` is indexed like `candidates`.
    pub fn allocate(
        &self,
        candidates: &[AllocationCandidate],
        correlation: &CorrelationMatrix,
    ) -> Result<Allocation> {
        if correlation.len() != candidates.len() {
            return Err(EngineError::config(format!(
                "correlation matrix is {}x{} for {} candidates",
                correlation.len(),
                correlation.len(),
                candidates.len()
            )));
        }

        let mut dropped = Vec::new();
        // (candidate index, sub-Kelly fraction)
        let mut sized: Vec<(usize, f64)> = Vec::new();
        for (i, c) in candidates.iter().enumerate() {
            match kelly_fraction(c.win_rate, c.avg_win, c.avg_loss) {
                Some(f) if f > 0.0 => {
                    let capped = (f * self.config.kelly_multiplier).min(self.config.max_position_fraction);
                    sized.push((i, capped));
                }
                Some(f) => dropped.push(DroppedCandidate {
                    instrument: c.instrument.clone(),
                    reason: format!("non-positive Kelly fraction ({:.3})", f),
                }),
                None => dropped.push(DroppedCandidate {
                    instrument: c.instrument.clone(),
                    reason: "win/loss statistics unavailable".to_string(),
                }),
            }
        }

        sized.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        if sized.len() > self.config.max_positions {
            for (i, _) in sized.drain(self.config.max_positions..) {
                dropped.push(DroppedCandidate {
                    instrument: candidates[i].instrument.clone(),
                    reason: format!("beyond max positions ({})", self.config.max_positions),
                });
            }
        }
        let kelly: Vec<f64> = sized.iter().map(|(_, f)| *f).collect();

        let mut fractions = self.risk_parity(candidates, &sized);
        let correlated_pairs = self.correlation_penalty(candidates, &sized, &mut fractions, correlation);

        let total: f64 = fractions.iter().sum();
        if total > self.config.max_portfolio_risk && total > 0.0 {
            let scale = self.config.max_portfolio_risk / total;
            debug!("Scaling allocation by {:.3} to respect max portfolio risk", scale);
            for f in fractions.iter_mut() {
                *f *= scale;
            }
        }

        let capital = self.config.total_capital;
        let positions: Vec<PortfolioPosition> = sized
            .iter()
            .zip(fractions.iter())
            .zip(kelly.iter())
            .map(|(((i, _), fraction), kelly)| PortfolioPosition {
                instrument: candidates[*i].instrument.clone(),
                capital_fraction: *fraction,
                dollar_risk: Decimal::from_f64(*fraction)
                    .map(|f| (f * capital).round_dp(2))
                    .unwrap_or(Decimal::ZERO),
                kelly_fraction: *kelly,
            })
            .collect();
        let total_fraction = positions.iter().map(|p| p.capital_fraction).sum();

        info!(
            positions = positions.len(),
            dropped = dropped.len(),
            total_fraction,
            "Portfolio allocated"
        );

        Ok(Allocation {
            positions,
            dropped,
            total_fraction,
            correlated_pairs,
        })
    }

    /// Rescale so each `fraction x volatility` equals the mean contribution.
    ///
    /// Total volatility-scaled risk is unchanged. Candidates without a usable
    /// volatility keep their Kelly size.
    fn risk_parity(&self, candidates: &[AllocationCandidate], sized: &[(usize, f64)]) -> Vec<f64> {
        let contributions: Vec<Option<f64>> = sized
            .iter()
            .map(|(i, f)| {
                let vol = candidates[*i].volatility;
                (vol.is_finite() && vol > 0.0).then(|| f * vol)
            })
            .collect();
        let usable: Vec<f64> = contributions.iter().flatten().copied().collect();
        if usable.len() < 2 {
            return sized.iter().map(|(_, f)| *f).collect();
        }
        let target = usable.iter().sum::<f64>() / usable.len() as f64;

        sized
            .iter()
            .zip(contributions.iter())
            .map(|((i, f), contribution)| match contribution {
                Some(_) => (target / candidates[*i].volatility).min(self.config.max_position_fraction),
                None => *f,
            })
            .collect()
    }

    /// Shrink the smaller of each highly correlated pair by `1 - excess`
    fn correlation_penalty(
        &self,
        candidates: &[AllocationCandidate],
        sized: &[(usize, f64)],
        fractions: &mut [f64],
        correlation: &CorrelationMatrix,
    ) -> Vec<(String, String, f64)> {
        let threshold = self.config.correlation_threshold;
        let mut pairs = Vec::new();
        for a in 0..sized.len() {
            for b in (a + 1)..sized.len() {
                let rho = correlation.get(sized[a].0, sized[b].0);
                if rho.abs() <= threshold {
                    continue;
                }
                let excess = rho.abs() - threshold;
                let smaller = if fractions[a] <= fractions[b] { a } else { b };
                fractions[smaller] *= (1.0 - excess).max(0.0);

                let name_a = candidates[sized[a].0].instrument.clone();
                let name_b = candidates[sized[b].0].instrument.clone();
                warn!("High correlation: {} <-> {} ({:.2})", name_a, name_b, rho);
                pairs.push((name_a, name_b, rho));
            }
        }
        pairs
    }
}

/// Backtest each named instrument on its own and build allocation inputs.
///
/// Candidates come back in universe order, with the correlation matrix of
/// their recent close-to-close returns.
pub fn candidates_from_backtest(
    simulator: &TradeSimulator,
    universe: &[PreparedSeries],
    instruments: &[String],
    weights: &WeightVector,
) -> (Vec<AllocationCandidate>, CorrelationMatrix) {
    let mut candidates = Vec::new();
    let mut returns = Vec::new();
    for series in universe.iter().filter(|s| instruments.contains(&s.instrument)) {
        let report = simulator.run(std::slice::from_ref(series), weights);
        let volatility = series
            .snapshots
            .last()
            .and_then(|s| s.volatility)
            .map(|v| v / 100.0)
            .unwrap_or(0.0);
        debug!(
            instrument = %series.instrument,
            trades = report.stats.total_trades,
            volatility,
            "Allocation candidate"
        );
        candidates.push(AllocationCandidate::from_stats(
            series.instrument.clone(),
            &report.stats,
            volatility,
        ));
        returns.push(recent_returns(series, CORRELATION_LOOKBACK));
    }
    (candidates, CorrelationMatrix::from_returns(&returns))
}

fn recent_returns(series: &PreparedSeries, lookback: usize) -> Vec<f64> {
    let start = series.len().saturating_sub(lookback + 1);
    series.candles[start..]
        .windows(2)
        .filter_map(|w| {
            let prev = w[0].close_f64();
            (prev > 0.0).then(|| w[1].close_f64() / prev - 1.0)
        })
        .collect()
}
