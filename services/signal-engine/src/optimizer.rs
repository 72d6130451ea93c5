//! Genetic weight optimizer
//!
//! Evolves integration weight vectors with tournament selection, blend
//! crossover, bounded mutation and elitism. Each generation's fitness is
//! evaluated on a bounded pool of blocking tasks; the generation boundary is
//! a barrier, and the only place cancellation is observed.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backtest::{SummaryStats, TradeSimulator};
use crate::config::{FitnessMetric, OptimizerConfig};
use crate::errors::{EngineError, Result};
use crate::indicators::PreparedSeries;
use crate::weights::{BestWeightsRecord, WeightVector, COMPONENTS};

/// Share of the composite fitness taken by win rate
const COMPOSITE_WIN_RATE_WEIGHT: f64 = 0.7;

/// One candidate weight vector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Chromosome {
    pub weights: WeightVector,
    pub fitness: f64,
    pub generation: usize,
}

/// Fixed-size arena of chromosomes for one generation
#[derive(Debug, Clone, PartialEq)]
pub struct Population {
    pub generation: usize,
    members: Vec<Chromosome>,
}

impl Population {
    pub fn new(generation: usize, members: Vec<Chromosome>) -> Self {
        Self { generation, members }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Chromosome> {
        self.members.get(index)
    }

    pub fn members(&self) -> &[Chromosome] {
        &self.members
    }

    /// Indices ordered best first; ties keep arena order
    pub fn ranked(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.members.len()).collect();
        order.sort_by(|a, b| {
            self.members[*b]
                .fitness
                .partial_cmp(&self.members[*a].fitness)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        order
    }

    pub fn best(&self) -> Option<&Chromosome> {
        self.ranked().first().and_then(|i| self.members.get(*i))
    }
}

/// Why the search ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Ran every configured generation
    Completed,
    /// Best fitness stopped improving; best-so-far is still returned
    Plateau,
    /// Cancelled at a generation boundary
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub best_weights: WeightVector,
    pub best_fitness: f64,
    pub fitness_metric: FitnessMetric,
    /// Best-so-far fitness after each generation, starting with generation 0
    pub history: Vec<f64>,
    pub generations_run: usize,
    pub stop_reason: StopReason,
}

impl OptimizationResult {
    pub fn to_record(&self) -> BestWeightsRecord {
        let metric = match self.fitness_metric {
            FitnessMetric::WinRate => "win_rate",
            FitnessMetric::Composite => "composite",
        };
        BestWeightsRecord {
            best_weights: self.best_weights,
            best_fitness: self.best_fitness,
            fitness_metric: metric.to_string(),
            generations_run: self.generations_run,
            fitness_history: self.history.clone(),
            recorded_at: Utc::now(),
        }
    }
}

/// Scores a weight vector; higher is better
pub trait FitnessEvaluator: Send + Sync + 'static {
    fn evaluate(&self, weights: &WeightVector) -> Result<f64>;
}

/// Fitness from a backtest statistic, in [0, 1]. No trades scores 0.
pub fn fitness_from_stats(stats: &SummaryStats, metric: FitnessMetric, sharpe_cap: f64) -> f64 {
    if stats.total_trades == 0 {
        return 0.0;
    }
    let win_rate = stats.win_rate.clamp(0.0, 1.0);
    let fitness = match metric {
        FitnessMetric::WinRate => win_rate,
        FitnessMetric::Composite => {
            let sharpe = (stats.sharpe_ratio / sharpe_cap).clamp(0.0, 1.0);
            COMPOSITE_WIN_RATE_WEIGHT * win_rate + (1.0 - COMPOSITE_WIN_RATE_WEIGHT) * sharpe
        }
    };
    if fitness.is_finite() {
        fitness
    } else {
        0.0
    }
}

/// Runs the simulator over a fixed, fully loaded dataset
pub struct BacktestFitness {
    simulator: TradeSimulator,
    universe: Arc<Vec<PreparedSeries>>,
    metric: FitnessMetric,
    sharpe_cap: f64,
}

impl BacktestFitness {
    pub fn new(
        simulator: TradeSimulator,
        universe: Arc<Vec<PreparedSeries>>,
        metric: FitnessMetric,
        sharpe_cap: f64,
    ) -> Self {
        Self {
            simulator,
            universe,
            metric,
            sharpe_cap,
        }
    }
}

impl FitnessEvaluator for BacktestFitness {
    fn evaluate(&self, weights: &WeightVector) -> Result<f64> {
        let report = self.simulator.run(&self.universe, weights);
        if report.skipped.len() == self.universe.len() && !self.universe.is_empty() {
            return Err(EngineError::insufficient(
                "universe",
                "every instrument was skipped",
            ));
        }
        Ok(fitness_from_stats(&report.stats, self.metric, self.sharpe_cap))
    }
}

pub struct GeneticOptimizer {
    config: OptimizerConfig,
    evaluator: Arc<dyn FitnessEvaluator>,
    cancel: CancellationToken,
}

impl GeneticOptimizer {
    pub fn new(config: OptimizerConfig, evaluator: Arc<dyn FitnessEvaluator>) -> Result<Self> {
        config.validate()?;
        if config.generations == 0 {
            return Err(EngineError::config("optimizer.generations must be at least 1"));
        }
        Ok(Self {
            config,
            evaluator,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self) -> Result<OptimizationResult> {
        let seed = self.config.seed.unwrap_or_else(rand::random);
        let mut rng = StdRng::seed_from_u64(seed);
        let bounds = self.config.bounds;
        let size = self.config.population_size;
        let elite_count = self.config.elite_count();

        info!(
            population = size,
            generations = self.config.generations,
            seed,
            fitness = ?self.config.fitness,
            "GeneticOptimizer: starting"
        );

        // Generation 0: the hand-tuned default plus random draws inside the bounds
        let mut initial = Vec::with_capacity(size);
        initial.push(bounds.project(WeightVector::default().as_array()));
        while initial.len() < size {
            let mut raw = [0.0; COMPONENTS];
            for (value, b) in raw.iter_mut().zip(bounds.as_array().iter()) {
                *value = if b.max > b.min { rng.gen_range(b.min..=b.max) } else { b.min };
            }
            initial.push(bounds.project(raw));
        }
        let fitness = self.evaluate(&initial).await;
        let mut population = Population::new(
            0,
            initial
                .into_iter()
                .zip(fitness)
                .map(|(weights, fitness)| Chromosome {
                    weights,
                    fitness,
                    generation: 0,
                })
                .collect(),
        );

        let mut best = population
            .best()
            .copied()
            .ok_or_else(|| EngineError::config("empty population"))?;
        let mut history = vec![best.fitness];
        let mut stale = 0usize;
        let mut stop_reason = StopReason::Completed;
        info!(generation = 0, best_fitness = best.fitness, "GeneticOptimizer: generation done");

        for generation in 1..self.config.generations {
            if self.cancel.is_cancelled() {
                warn!(generation, "GeneticOptimizer: cancelled, returning best so far");
                stop_reason = StopReason::Cancelled;
                break;
            }

            let ranked = population.ranked();
            let mut next: Vec<Chromosome> = ranked
                .iter()
                .take(elite_count)
                .filter_map(|i| population.get(*i).copied())
                .collect();

            let mut offspring = Vec::with_capacity(size - next.len());
            while next.len() + offspring.len() < size {
                let p1 = self.tournament_select(&population, &mut rng);
                let p2 = self.tournament_select(&population, &mut rng);
                let mut child = if rng.gen::<f64>() < self.config.crossover_rate {
                    blend(&p1, &p2, rng.gen::<f64>())
                } else {
                    p1.as_array()
                };
                self.mutate(&mut child, &mut rng);
                offspring.push(bounds.project(child));
            }

            let fitness = self.evaluate(&offspring).await;
            next.extend(
                offspring
                    .into_iter()
                    .zip(fitness)
                    .map(|(weights, fitness)| Chromosome {
                        weights,
                        fitness,
                        generation,
                    }),
            );
            population = Population::new(generation, next);

            let generation_best = population
                .best()
                .copied()
                .ok_or_else(|| EngineError::config("empty population"))?;
            if generation_best.fitness > best.fitness + self.config.plateau_epsilon {
                stale = 0;
            } else {
                stale += 1;
            }
            if generation_best.fitness > best.fitness {
                best = generation_best;
            }
            history.push(best.fitness);

            info!(
                generation,
                best_fitness = best.fitness,
                generation_best = generation_best.fitness,
                "GeneticOptimizer: generation done"
            );

            if stale >= self.config.plateau_generations {
                info!(
                    generation,
                    "GeneticOptimizer: no improvement for {} generations, stopping", stale
                );
                stop_reason = StopReason::Plateau;
                break;
            }
        }

        info!(
            best_fitness = best.fitness,
            generations = history.len(),
            reason = ?stop_reason,
            "GeneticOptimizer: finished with {}",
            best.weights
        );

        Ok(OptimizationResult {
            best_weights: best.weights,
            best_fitness: best.fitness,
            fitness_metric: self.config.fitness,
            generations_run: history.len(),
            history,
            stop_reason,
        })
    }

    /// Evaluate a batch on the worker pool; results come back in input order
    async fn evaluate(&self, candidates: &[WeightVector]) -> Vec<f64> {
        let completed: Vec<(usize, Result<f64>)> = stream::iter(candidates.iter().copied().enumerate())
            .map(|(i, weights)| {
                let evaluator = Arc::clone(&self.evaluator);
                async move {
                    let result = tokio::task::spawn_blocking(move || evaluator.evaluate(&weights))
                        .await
                        .unwrap_or_else(|e| {
                            Err(EngineError::Evaluation(e.to_string()))
                        });
                    (i, result)
                }
            })
            .buffer_unordered(self.config.workers)
            .collect()
            .await;

        let mut fitness = vec![0.0; candidates.len()];
        for (i, result) in completed {
            match result {
                Ok(value) if value.is_finite() => fitness[i] = value,
                Ok(value) => warn!("Chromosome {} produced non-finite fitness {}", i, value),
                Err(e) => warn!(kind = %e.kind(), "Chromosome {} failed evaluation: {}", i, e),
            }
        }
        debug!("Evaluated {} chromosomes", candidates.len());
        fitness
    }

    /// Best of k random members
    fn tournament_select(&self, population: &Population, rng: &mut StdRng) -> WeightVector {
        let n = population.len();
        let k = self.config.tournament_size.min(n).max(1);
        let mut winner = rng.gen_range(0..n);
        for _ in 1..k {
            let challenger = rng.gen_range(0..n);
            if population.members[challenger].fitness > population.members[winner].fitness {
                winner = challenger;
            }
        }
        population.members[winner].weights
    }

    /// Perturb each component with probability `mutation_rate`
    fn mutate(&self, genome: &mut [f64; COMPONENTS], rng: &mut StdRng) {
        let step = self.config.mutation_step;
        for gene in genome.iter_mut() {
            if rng.gen::<f64>() < self.config.mutation_rate {
                *gene = (*gene + rng.gen_range(-step..=step)).max(0.0);
            }
        }
    }
}

/// Component-wise blend `alpha * a + (1 - alpha) * b`
fn blend(a: &WeightVector, b: &WeightVector, alpha: f64) -> [f64; COMPONENTS] {
    let a = a.as_array();
    let b = b.as_array();
    let mut child = [0.0; COMPONENTS];
    for i in 0..COMPONENTS {
        child[i] = alpha * a[i] + (1.0 - alpha) * b[i];
    }
    child
}
