//! Signal Engine Library
//!
//! Multi-source signal scoring, realistic backtesting and genetic tuning of
//! the integration weights for Trawling Traders.

pub mod backtest;
pub mod brain;
pub mod config;
pub mod dataset;
pub mod errors;
pub mod indicators;
pub mod optimizer;
pub mod portfolio;
pub mod scanner;
pub mod types;
pub mod weights;

mod tests;

// Re-export main types for convenience
pub use backtest::{BacktestReport, EquityPoint, ExitReason, SummaryStats, Trade, TradeSimulator};
pub use brain::{
    ConfidenceLabel, ConfidenceModel, IntegratedSignal, Recommendation, ScoringPipeline,
};
pub use config::{
    ConfirmationConfig, EngineConfig, FitnessMetric, OptimizerConfig, PortfolioConfig,
    ScoringConfig, SimulatorConfig, StopBasis,
};
pub use errors::{EngineError, ErrorKind, Result};
pub use indicators::{IndicatorProvider, PreparedSeries, StandardIndicators};
pub use optimizer::{BacktestFitness, GeneticOptimizer, OptimizationResult, StopReason};
pub use portfolio::{Allocation, AllocationCandidate, PortfolioAllocator, PortfolioPosition};
pub use scanner::{ScanReport, UniverseScanner};
pub use types::{Candle, Dataset, IndicatorSnapshot, InstrumentSeries};
pub use weights::{ActiveWeights, BestWeightsRecord, WeightBounds, WeightVector};
