//! Signal Engine - scoring, backtesting and weight optimization
//!
//! Batch entry points:
//! 1. `optimize` evolves integration weights against historical data
//! 2. `backtest` replays history with a weight vector and reports statistics
//! 3. `scan` scores the latest bar of every instrument and sizes candidates
//! 4. `train` fits the confidence model on simulated trade outcomes

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

use signal_engine::brain::{load_classifier, HeuristicClassifier, LogisticModel};
use signal_engine::config::{EngineConfig, FitnessMetric};
use signal_engine::dataset::{ensure_usable, load_dataset, prepare_universe};
use signal_engine::errors::{EngineError, ErrorKind};
use signal_engine::indicators::{PreparedSeries, StandardIndicators};
use signal_engine::optimizer::{BacktestFitness, GeneticOptimizer};
use signal_engine::portfolio::{candidates_from_backtest, PortfolioAllocator};
use signal_engine::scanner::UniverseScanner;
use signal_engine::weights::{ActiveWeights, BestWeightsRecord, WeightVector};
use signal_engine::{ScoringPipeline, TradeSimulator};

#[derive(Parser, Debug)]
#[command(name = "signal-engine", version, about = "Adaptive signal scoring and weight optimization")]
struct Cli {
    /// Configuration file (TOML, JSON or YAML); SIGNAL_ENGINE__* variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Trained confidence model; the heuristic is used when absent
    #[arg(long, global = true)]
    classifier: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evolve integration weights and save the best record
    Optimize {
        #[arg(long)]
        dataset: PathBuf,
        #[arg(long)]
        population: Option<usize>,
        #[arg(long)]
        generations: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        output: PathBuf,
        /// win_rate or composite
        #[arg(long)]
        fitness: Option<FitnessMetric>,
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Replay history with a weight vector
    Backtest {
        #[arg(long)]
        dataset: PathBuf,
        /// Best-weights record from `optimize`
        #[arg(long)]
        weights: Option<PathBuf>,
        /// Write the trade ledger as CSV
        #[arg(long)]
        ledger: Option<PathBuf>,
    },
    /// Score the latest bar of every instrument
    Scan {
        #[arg(long)]
        dataset: PathBuf,
        #[arg(long)]
        weights: Option<PathBuf>,
        /// Size actionable instruments with the portfolio allocator
        #[arg(long)]
        allocate: bool,
    },
    /// Fit the confidence model on simulated trade outcomes
    Train {
        #[arg(long)]
        dataset: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        weights: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr; stdout carries the JSON results
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let kind = e.downcast_ref::<EngineError>().map(EngineError::kind);
            let label = kind.map(|k| k.as_str()).unwrap_or("other");
            error!("{:#}", e);
            eprintln!("error[{}]: {:#}", label, e);
            ExitCode::from(exit_code(kind))
        }
    }
}

fn exit_code(kind: Option<ErrorKind>) -> u8 {
    match kind {
        Some(ErrorKind::Configuration) => 2,
        Some(ErrorKind::DataInsufficient) => 3,
        Some(ErrorKind::Io) | Some(ErrorKind::Serialization) => 4,
        _ => 1,
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = EngineConfig::load(cli.config.as_deref())?;
    let classifier = load_classifier(cli.classifier.as_deref()).await;
    info!("Starting Signal Engine (confidence model: {})", classifier.name());

    match cli.command {
        Command::Optimize {
            dataset,
            population,
            generations,
            seed,
            output,
            fitness,
            workers,
        } => {
            let opt = &mut config.optimizer;
            if let Some(population) = population {
                opt.population_size = population;
            }
            if let Some(generations) = generations {
                opt.generations = generations;
            }
            if let Some(fitness) = fitness {
                opt.fitness = fitness;
            }
            if let Some(workers) = workers {
                opt.workers = workers;
            }
            opt.seed = seed.or(opt.seed);
            config.validate()?;

            let pipeline = Arc::new(ScoringPipeline::new(&config, classifier)?);
            let universe = Arc::new(load_universe(&dataset, pipeline.min_bars()).await?);
            let simulator = TradeSimulator::new(pipeline, config.simulator.clone());
            let evaluator = BacktestFitness::new(
                simulator,
                universe,
                config.optimizer.fitness,
                config.optimizer.sharpe_cap,
            );

            let optimizer = GeneticOptimizer::new(config.optimizer.clone(), Arc::new(evaluator))?;
            let cancel = optimizer.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, stopping after the current generation");
                    cancel.cancel();
                }
            });

            let result = optimizer.run().await?;
            info!(
                "Optimized weights {:?} (started from {:?})",
                result.best_weights.as_array(),
                config.weights.as_array()
            );

            result.to_record().save(&output).await?;
            info!(
                "Best fitness {:.4} after {} generations ({:?}); saved to {}",
                result.best_fitness,
                result.generations_run,
                result.stop_reason,
                output.display()
            );
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        Command::Backtest {
            dataset,
            weights,
            ledger,
        } => {
            let weights = resolve_weights(weights.as_deref(), config.weights).await?;
            let pipeline = Arc::new(ScoringPipeline::new(&config, classifier)?);
            let universe = load_universe(&dataset, pipeline.min_bars()).await?;
            let simulator = TradeSimulator::new(pipeline, config.simulator.clone());

            let report = simulator.run(&universe, &weights);
            if let Some(path) = ledger {
                report.export_ledger(&path)?;
            }
            println!("{}", serde_json::to_string_pretty(&report.stats)?);
        }

        Command::Scan {
            dataset,
            weights,
            allocate,
        } => {
            let active = ActiveWeights::new(resolve_weights(weights.as_deref(), config.weights).await?);
            let pipeline = Arc::new(ScoringPipeline::new(&config, classifier)?);
            let universe = Arc::new(load_universe(&dataset, pipeline.min_bars()).await?);

            let scanner = UniverseScanner::new(Arc::clone(&pipeline), config.scan.workers);
            let report = scanner.scan_active(Arc::clone(&universe), &active).await;
            println!("{}", serde_json::to_string_pretty(&report)?);

            if allocate {
                let actionable: Vec<String> = report
                    .actionable(config.simulator.entry_threshold)
                    .map(|s| s.instrument.clone())
                    .collect();
                let simulator = TradeSimulator::new(pipeline, config.simulator.clone());
                let (candidates, correlation) =
                    candidates_from_backtest(&simulator, &universe, &actionable, &active.snapshot());
                let allocation =
                    PortfolioAllocator::new(config.portfolio.clone()).allocate(&candidates, &correlation)?;
                println!("{}", serde_json::to_string_pretty(&allocation)?);
            }
        }

        Command::Train {
            dataset,
            output,
            weights,
        } => {
            let weights = resolve_weights(weights.as_deref(), config.weights).await?;
            // Labels come from trades taken without a trained model in the loop
            let pipeline = Arc::new(ScoringPipeline::new(&config, Arc::new(HeuristicClassifier))?);
            let universe = load_universe(&dataset, pipeline.min_bars()).await?;
            let simulator = TradeSimulator::new(pipeline, config.simulator.clone());

            let samples = simulator.run(&universe, &weights).training_samples();
            let model = LogisticModel::fit(&samples)?;
            model.save(&output).await?;
            info!("Trained confidence model on {} trades; saved to {}", samples.len(), output.display());
        }
    }

    Ok(())
}

async fn load_universe(path: &Path, min_bars: usize) -> anyhow::Result<Vec<PreparedSeries>> {
    let dataset = load_dataset(path)
        .await
        .with_context(|| format!("loading dataset {}", path.display()))?;
    let universe = prepare_universe(&dataset, &StandardIndicators);
    ensure_usable(&universe, min_bars)?;
    Ok(universe)
}

async fn resolve_weights(path: Option<&Path>, fallback: WeightVector) -> anyhow::Result<WeightVector> {
    match path {
        Some(path) => {
            let record = BestWeightsRecord::load(path).await?;
            info!(
                "Using weights {} (fitness {:.4}, {})",
                record.best_weights, record.best_fitness, record.fitness_metric
            );
            Ok(record.best_weights)
        }
        None => Ok(fallback),
    }
}
