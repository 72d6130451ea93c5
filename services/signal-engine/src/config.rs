//! Engine configuration
//!
//! Every section deserializes with defaults so a partial file (or none at
//! all) is valid. `EngineConfig::load` layers an optional file under
//! `SIGNAL_ENGINE__*` environment overrides, e.g.
//! `SIGNAL_ENGINE__OPTIMIZER__POPULATION_SIZE=20`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::errors::{EngineError, Result};
use crate::weights::{WeightBounds, WeightVector};

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct EngineConfig {
    /// Weights used when no optimized record is supplied
    #[serde(default)]
    pub weights: WeightVector,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub simulator: SimulatorConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub portfolio: PortfolioConfig,
    #[serde(default)]
    pub scan: ScanConfig,
}

impl EngineConfig {
    /// Load from an optional file plus environment overrides, then validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            debug!("Loading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("SIGNAL_ENGINE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg: EngineConfig = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings that would make scoring or search meaningless
    pub fn validate(&self) -> Result<()> {
        self.confirmation.validate()?;
        self.scoring.validate()?;
        self.simulator.validate()?;
        self.optimizer.validate()?;
        self.portfolio.validate()?;
        if self.scan.workers == 0 {
            return Err(EngineError::config("scan.workers must be at least 1"));
        }
        Ok(())
    }
}

/// Confirmation aggregator settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ConfirmationConfig {
    /// Named vote sources, evaluated in order
    #[serde(default = "default_sources")]
    pub sources: Vec<String>,
    /// ATR% below this is the low-volatility regime
    #[serde(default = "default_low_volatility_atr_pct")]
    pub low_volatility_atr_pct: f64,
    /// ATR% at or above this is the high-volatility regime
    #[serde(default = "default_high_volatility_atr_pct")]
    pub high_volatility_atr_pct: f64,
    #[serde(default = "default_required_low")]
    pub required_low: usize,
    #[serde(default = "default_required_normal")]
    pub required_normal: usize,
    #[serde(default = "default_required_high")]
    pub required_high: usize,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            low_volatility_atr_pct: default_low_volatility_atr_pct(),
            high_volatility_atr_pct: default_high_volatility_atr_pct(),
            required_low: default_required_low(),
            required_normal: default_required_normal(),
            required_high: default_required_high(),
        }
    }
}

impl ConfirmationConfig {
    fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(EngineError::config("confirmation.sources must not be empty"));
        }
        if self.low_volatility_atr_pct > self.high_volatility_atr_pct {
            return Err(EngineError::config(
                "confirmation.low_volatility_atr_pct exceeds high_volatility_atr_pct",
            ));
        }
        if self.required_low == 0 || self.required_normal == 0 || self.required_high == 0 {
            return Err(EngineError::config("confirmation thresholds must be at least 1"));
        }
        Ok(())
    }
}

fn default_sources() -> Vec<String> {
    [
        "rsi_moderation",
        "volume_confirmation",
        "trend_alignment",
        "price_action",
        "multi_timeframe",
        "macd_momentum",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_low_volatility_atr_pct() -> f64 { 1.5 }
fn default_high_volatility_atr_pct() -> f64 { 3.0 }
fn default_required_low() -> usize { 3 }
fn default_required_normal() -> usize { 4 }
fn default_required_high() -> usize { 5 }

/// Score bands for recommendations
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct RecommendationBands {
    #[serde(default = "default_hold_at")]
    pub hold_at: f64,
    #[serde(default = "default_buy_at")]
    pub buy_at: f64,
    #[serde(default = "default_strong_buy_at")]
    pub strong_buy_at: f64,
}

impl Default for RecommendationBands {
    fn default() -> Self {
        Self {
            hold_at: default_hold_at(),
            buy_at: default_buy_at(),
            strong_buy_at: default_strong_buy_at(),
        }
    }
}

fn default_hold_at() -> f64 { 60.0 }
fn default_buy_at() -> f64 { 75.0 }
fn default_strong_buy_at() -> f64 { 90.0 }

/// Integrator and per-bar scoring settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ScoringConfig {
    /// Bars required before an instrument is scored at all
    #[serde(default = "default_min_bars")]
    pub min_bars: usize,
    /// Lookback window for entry timing, ending at the signal bar
    #[serde(default = "default_entry_window")]
    pub entry_window: usize,
    /// Max component spread still counted as agreement
    #[serde(default = "default_agreement_width")]
    pub agreement_width: f64,
    /// Substitute for an unavailable component
    #[serde(default = "default_neutral_score")]
    pub neutral_score: f64,
    #[serde(default)]
    pub bands: RecommendationBands,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            min_bars: default_min_bars(),
            entry_window: default_entry_window(),
            agreement_width: default_agreement_width(),
            neutral_score: default_neutral_score(),
            bands: RecommendationBands::default(),
        }
    }
}

impl ScoringConfig {
    fn validate(&self) -> Result<()> {
        let b = &self.bands;
        if !(0.0..=100.0).contains(&b.hold_at)
            || !(b.hold_at <= b.buy_at && b.buy_at <= b.strong_buy_at && b.strong_buy_at <= 100.0)
        {
            return Err(EngineError::config(format!(
                "recommendation bands must be ordered within [0, 100], got {}/{}/{}",
                b.hold_at, b.buy_at, b.strong_buy_at
            )));
        }
        if self.entry_window < 3 {
            return Err(EngineError::config("scoring.entry_window must be at least 3"));
        }
        if !(0.0..=100.0).contains(&self.neutral_score) {
            return Err(EngineError::config("scoring.neutral_score must be within [0, 100]"));
        }
        if !(self.agreement_width > 0.0) {
            return Err(EngineError::config("scoring.agreement_width must be positive"));
        }
        Ok(())
    }
}

fn default_min_bars() -> usize { 50 }
fn default_entry_window() -> usize { 10 }
fn default_agreement_width() -> f64 { 15.0 }
fn default_neutral_score() -> f64 { 50.0 }

/// How the initial stop distance is derived
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopBasis {
    /// Multiple of ATR below entry
    #[default]
    Atr,
    /// Fixed percent below entry
    Percent,
}

/// Trade simulator risk settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SimulatorConfig {
    #[serde(default = "default_initial_capital")]
    pub initial_capital: Decimal,
    /// Fraction of running capital risked per trade (one R)
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade: Decimal,
    /// Largest entry notional for one position, as a fraction of running capital
    #[serde(default = "default_max_position_notional")]
    pub max_position_fraction: Decimal,
    /// Final score needed to open a position
    #[serde(default = "default_entry_threshold")]
    pub entry_threshold: f64,
    #[serde(default)]
    pub stop_basis: StopBasis,
    #[serde(default = "default_stop_atr_multiple")]
    pub stop_atr_multiple: f64,
    /// Used when `stop_basis` is `percent` or ATR is unavailable
    #[serde(default = "default_stop_pct")]
    pub stop_pct: f64,
    #[serde(default = "default_t1_r")]
    pub t1_r: f64,
    #[serde(default = "default_t2_r")]
    pub t2_r: f64,
    #[serde(default = "default_t3_r")]
    pub t3_r: f64,
    /// Share of the original size closed at T1
    #[serde(default = "default_exit_fraction")]
    pub t1_exit_fraction: Decimal,
    /// Share of the original size closed at T2; the rest rides to the final exit
    #[serde(default = "default_exit_fraction")]
    pub t2_exit_fraction: Decimal,
    #[serde(default = "default_trail_atr_multiple")]
    pub trail_atr_multiple: f64,
    #[serde(default = "default_max_hold_bars")]
    pub max_hold_bars: usize,
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: f64,
    #[serde(default = "default_commission_bps")]
    pub commission_bps: f64,
    /// Slippage as a multiple of the fill bar's ATR%; 0 keeps it fixed
    #[serde(default)]
    pub atr_slippage_factor: f64,
    /// Ceiling for ATR-scaled slippage
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            initial_capital: default_initial_capital(),
            risk_per_trade: default_risk_per_trade(),
            max_position_fraction: default_max_position_notional(),
            entry_threshold: default_entry_threshold(),
            stop_basis: StopBasis::default(),
            stop_atr_multiple: default_stop_atr_multiple(),
            stop_pct: default_stop_pct(),
            t1_r: default_t1_r(),
            t2_r: default_t2_r(),
            t3_r: default_t3_r(),
            t1_exit_fraction: default_exit_fraction(),
            t2_exit_fraction: default_exit_fraction(),
            trail_atr_multiple: default_trail_atr_multiple(),
            max_hold_bars: default_max_hold_bars(),
            slippage_bps: default_slippage_bps(),
            commission_bps: default_commission_bps(),
            atr_slippage_factor: 0.0,
            max_slippage_bps: default_max_slippage_bps(),
        }
    }
}

impl SimulatorConfig {
    fn validate(&self) -> Result<()> {
        if self.initial_capital <= Decimal::ZERO {
            return Err(EngineError::config("simulator.initial_capital must be positive"));
        }
        if self.risk_per_trade <= Decimal::ZERO || self.risk_per_trade > Decimal::ONE {
            return Err(EngineError::config("simulator.risk_per_trade must be in (0, 1]"));
        }
        if self.max_position_fraction <= Decimal::ZERO || self.max_position_fraction > Decimal::ONE {
            return Err(EngineError::config("simulator.max_position_fraction must be in (0, 1]"));
        }
        if self.t1_exit_fraction <= Decimal::ZERO
            || self.t2_exit_fraction <= Decimal::ZERO
            || self.t1_exit_fraction + self.t2_exit_fraction >= Decimal::ONE
        {
            return Err(EngineError::config(format!(
                "partial exit fractions must be positive and leave a remainder, got {}/{}",
                self.t1_exit_fraction, self.t2_exit_fraction
            )));
        }
        if !(self.t1_r > 0.0 && self.t1_r < self.t2_r && self.t2_r < self.t3_r) {
            return Err(EngineError::config(format!(
                "targets must satisfy 0 < T1 < T2 < T3, got {}/{}/{}",
                self.t1_r, self.t2_r, self.t3_r
            )));
        }
        if !(self.stop_atr_multiple > 0.0 && self.stop_pct > 0.0 && self.stop_pct < 100.0) {
            return Err(EngineError::config("stop distance settings must be positive"));
        }
        if !(self.trail_atr_multiple > 0.0) {
            return Err(EngineError::config("simulator.trail_atr_multiple must be positive"));
        }
        if self.max_hold_bars == 0 {
            return Err(EngineError::config("simulator.max_hold_bars must be at least 1"));
        }
        if self.slippage_bps < 0.0 || self.commission_bps < 0.0 || self.atr_slippage_factor < 0.0 {
            return Err(EngineError::config("trading costs must not be negative"));
        }
        if self.max_slippage_bps < self.slippage_bps {
            return Err(EngineError::config(
                "simulator.max_slippage_bps must not be below slippage_bps",
            ));
        }
        Ok(())
    }
}

fn default_initial_capital() -> Decimal { Decimal::from(10_000) }
fn default_risk_per_trade() -> Decimal { Decimal::new(2, 2) }
fn default_max_position_notional() -> Decimal { Decimal::new(25, 2) }
fn default_exit_fraction() -> Decimal { Decimal::ONE / Decimal::from(3) }
fn default_entry_threshold() -> f64 { 75.0 }
fn default_stop_atr_multiple() -> f64 { 2.0 }
fn default_stop_pct() -> f64 { 2.0 }
fn default_t1_r() -> f64 { 1.5 }
fn default_t2_r() -> f64 { 2.5 }
fn default_t3_r() -> f64 { 4.0 }
fn default_trail_atr_multiple() -> f64 { 2.0 }
fn default_max_hold_bars() -> usize { 30 }
fn default_slippage_bps() -> f64 { 10.0 }
fn default_commission_bps() -> f64 { 20.0 }
fn default_max_slippage_bps() -> f64 { 100.0 }

/// Statistic the optimizer maximizes
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FitnessMetric {
    WinRate,
    /// 0.7 x win rate + 0.3 x normalized Sharpe-like ratio
    #[default]
    Composite,
}

impl std::str::FromStr for FitnessMetric {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "win_rate" => Ok(FitnessMetric::WinRate),
            "composite" => Ok(FitnessMetric::Composite),
            other => Err(EngineError::config(format!("unknown fitness metric: {}", other))),
        }
    }
}

/// Genetic optimizer settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct OptimizerConfig {
    #[serde(default = "default_population_size")]
    pub population_size: usize,
    #[serde(default = "default_generations")]
    pub generations: usize,
    #[serde(default = "default_tournament_size")]
    pub tournament_size: usize,
    #[serde(default = "default_crossover_rate")]
    pub crossover_rate: f64,
    #[serde(default = "default_mutation_rate")]
    pub mutation_rate: f64,
    /// Max absolute perturbation per mutated component
    #[serde(default = "default_mutation_step")]
    pub mutation_step: f64,
    #[serde(default = "default_elite_ratio")]
    pub elite_ratio: f64,
    /// Minimum improvement that resets the plateau counter
    #[serde(default = "default_plateau_epsilon")]
    pub plateau_epsilon: f64,
    /// Generations without improvement before stopping early
    #[serde(default = "default_plateau_generations")]
    pub plateau_generations: usize,
    #[serde(default)]
    pub fitness: FitnessMetric,
    /// Sharpe-like ratio mapped to 1.0 in the composite fitness
    #[serde(default = "default_sharpe_cap")]
    pub sharpe_cap: f64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub bounds: WeightBounds,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            population_size: default_population_size(),
            generations: default_generations(),
            tournament_size: default_tournament_size(),
            crossover_rate: default_crossover_rate(),
            mutation_rate: default_mutation_rate(),
            mutation_step: default_mutation_step(),
            elite_ratio: default_elite_ratio(),
            plateau_epsilon: default_plateau_epsilon(),
            plateau_generations: default_plateau_generations(),
            fitness: FitnessMetric::default(),
            sharpe_cap: default_sharpe_cap(),
            workers: default_workers(),
            seed: None,
            bounds: WeightBounds::default(),
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.population_size < 2 {
            return Err(EngineError::config("optimizer.population_size must be at least 2"));
        }
        if self.tournament_size == 0 {
            return Err(EngineError::config("optimizer.tournament_size must be at least 1"));
        }
        for (name, rate) in [
            ("crossover_rate", self.crossover_rate),
            ("mutation_rate", self.mutation_rate),
            ("elite_ratio", self.elite_ratio),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(EngineError::config(format!(
                    "optimizer.{} must be within [0, 1], got {}",
                    name, rate
                )));
            }
        }
        if !(self.mutation_step > 0.0) || !(self.sharpe_cap > 0.0) || self.plateau_epsilon < 0.0 {
            return Err(EngineError::config(
                "optimizer.mutation_step and sharpe_cap must be positive, plateau_epsilon non-negative",
            ));
        }
        if self.workers == 0 {
            return Err(EngineError::config("optimizer.workers must be at least 1"));
        }
        self.bounds.validate()
    }

    /// Elites carried over unchanged each generation
    pub fn elite_count(&self) -> usize {
        ((self.population_size as f64 * self.elite_ratio) as usize)
            .max(1)
            .min(self.population_size)
    }
}

fn default_population_size() -> usize { 50 }
fn default_generations() -> usize { 100 }
fn default_tournament_size() -> usize { 3 }
fn default_crossover_rate() -> f64 { 0.8 }
fn default_mutation_rate() -> f64 { 0.15 }
fn default_mutation_step() -> f64 { 0.1 }
fn default_elite_ratio() -> f64 { 0.1 }
fn default_plateau_epsilon() -> f64 { 1e-6 }
fn default_plateau_generations() -> usize { 20 }
fn default_sharpe_cap() -> f64 { 3.0 }
fn default_workers() -> usize { 4 }

/// Portfolio allocator settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PortfolioConfig {
    #[serde(default = "default_total_capital")]
    pub total_capital: Decimal,
    /// Multiplier applied to the raw Kelly fraction (0.5 = half-Kelly)
    #[serde(default = "default_kelly_multiplier")]
    pub kelly_multiplier: f64,
    /// Hard ceiling on any single position's capital fraction
    #[serde(default = "default_max_position_fraction")]
    pub max_position_fraction: f64,
    #[serde(default = "default_correlation_threshold")]
    pub correlation_threshold: f64,
    /// Ceiling on the summed capital fraction of all positions
    #[serde(default = "default_max_portfolio_risk")]
    pub max_portfolio_risk: f64,
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            total_capital: default_total_capital(),
            kelly_multiplier: default_kelly_multiplier(),
            max_position_fraction: default_max_position_fraction(),
            correlation_threshold: default_correlation_threshold(),
            max_portfolio_risk: default_max_portfolio_risk(),
            max_positions: default_max_positions(),
        }
    }
}

impl PortfolioConfig {
    fn validate(&self) -> Result<()> {
        if self.total_capital <= Decimal::ZERO {
            return Err(EngineError::config("portfolio.total_capital must be positive"));
        }
        if !(self.kelly_multiplier > 0.0 && self.kelly_multiplier <= 1.0) {
            return Err(EngineError::config("portfolio.kelly_multiplier must be in (0, 1]"));
        }
        if !(self.max_position_fraction > 0.0 && self.max_position_fraction <= 1.0)
            || !(self.max_portfolio_risk > 0.0 && self.max_portfolio_risk <= 1.0)
        {
            return Err(EngineError::config("portfolio fractions must be in (0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.correlation_threshold) {
            return Err(EngineError::config("portfolio.correlation_threshold must be in [0, 1]"));
        }
        if self.max_positions == 0 {
            return Err(EngineError::config("portfolio.max_positions must be at least 1"));
        }
        Ok(())
    }
}

fn default_total_capital() -> Decimal { Decimal::from(100_000) }
fn default_kelly_multiplier() -> f64 { 0.5 }
fn default_max_position_fraction() -> f64 { 0.25 }
fn default_correlation_threshold() -> f64 { 0.7 }
fn default_max_portfolio_risk() -> f64 { 0.6 }
fn default_max_positions() -> usize { 10 }

/// Universe scan settings
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct ScanConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}
