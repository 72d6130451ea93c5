//! End-to-end engine harness
//!
//! Validates the full loop on scripted and synthetic history:
//! snapshots → integrated signal → simulated trade → report → optimizer → allocation


use fixtures::*;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;

use signal_engine::{
    backtest::ExitReason,
    brain::Recommendation,
    config::{FitnessMetric, OptimizerConfig},
    dataset::prepare_universe,
    indicators::{PreparedSeries, StandardIndicators},
    optimizer::{BacktestFitness, GeneticOptimizer, StopReason},
    portfolio::{candidates_from_backtest, PortfolioAllocator},
    scanner::UniverseScanner,
    weights::{ActiveWeights, WeightVector, SIMPLEX_TOLERANCE},
};

#[test]
fn test_t1_partial_exit_and_equity() {
    let config = scripted_config();
    let sim = simulator(&config);
    let series = scripted_series("SCRIPT", &grind_to_t2());

    let run = sim.run_instrument(&series, &WeightVector::default()).unwrap();
    assert_eq!(run.trades.len(), 1);
    let trade = &run.trades[0];
    assert_eq!(trade.entry_time, ts(SIGNAL_BAR as i64));
    assert_eq!(trade.entry_price, Decimal::from(100));
    assert_eq!(trade.quantity, Decimal::from(100));
    assert_eq!(trade.targets.t1, Decimal::from(103));

    let first = &trade.exits[0];
    assert_eq!(first.reason, ExitReason::Target1);
    assert_eq!(first.fraction, Decimal::ONE / Decimal::from(3));
    assert_eq!(first.timestamp, ts(56));

    let report = sim.run(&[series], &WeightVector::default());
    let point = report
        .equity_curve
        .iter()
        .find(|p| p.timestamp == first.timestamp)
        .expect("equity point at T1");
    let expected = config.simulator.initial_capital
        + (trade.quantity * first.fraction) * (trade.targets.t1 - trade.entry_price);
    assert_eq!(point.equity, expected);
}

#[test]
fn test_configured_exit_fractions() {
    let mut config = scripted_config();
    config.simulator.t1_exit_fraction = Decimal::new(5, 1);
    config.simulator.t2_exit_fraction = Decimal::new(25, 2);
    config.validate().unwrap();

    let sim = simulator(&config);
    let report = sim.run(&[scripted_series("HALF", &grind_to_t2())], &WeightVector::default());
    let trade = &report.trades[0];

    let fills: Vec<(ExitReason, Decimal)> = trade.exits.iter().map(|e| (e.reason, e.fraction)).collect();
    assert_eq!(
        fills,
        vec![
            (ExitReason::Target1, Decimal::new(5, 1)),
            (ExitReason::Target2, Decimal::new(25, 2)),
            (ExitReason::EndOfData, Decimal::new(25, 2)),
        ]
    );
    assert_eq!(trade.exits[0].quantity, Decimal::from(50));
    assert_eq!(trade.total_fraction(), Decimal::ONE);

    // Half the position books 3 points at T1
    let point = report
        .equity_curve
        .iter()
        .find(|p| p.timestamp == ts(56))
        .expect("equity point at T1");
    assert_eq!(point.equity, Decimal::from(10_150));
}

#[test]
fn test_concurrent_positions_share_capital() {
    let universe = [
        scripted_series("A", &grind_to_t2()),
        scripted_series("B", &grind_to_t2()),
    ];
    let capital = Decimal::from(10_000);

    let mut capped = scripted_config();
    capped.simulator.max_position_fraction = Decimal::new(25, 2);
    let report = simulator(&capped).run(&universe, &WeightVector::default());
    assert_eq!(report.trades.len(), 2);
    assert!(report.trades.iter().all(|t| t.entry_time == ts(SIGNAL_BAR as i64)));
    assert!(report.trades.iter().all(|t| t.quantity == Decimal::from(25)));
    let notional: Decimal = report.trades.iter().map(|t| t.entry_price * t.quantity).sum();
    assert_eq!(notional, Decimal::from(5_000));

    // Full-size positions: the first entry takes the whole account
    let report = simulator(&scripted_config()).run(&universe, &WeightVector::default());
    assert_eq!(report.trades.len(), 1);
    assert_eq!(report.trades[0].instrument, "A");
    assert!(report.trades[0].entry_price * report.trades[0].quantity <= capital);
    assert_eq!(
        report.stats.final_equity,
        capital + report.trades[0].realized_pnl
    );
}

#[test]
fn test_stop_moves_to_breakeven_after_t1() {
    let mut bars: Vec<(f64, f64, f64, f64)> = grind_to_t2().into_iter().take(6).collect();
    // Falls back through entry after T1 without gapping below it
    bars.push((101.0, 101.5, 99.0, 99.5));

    let sim = simulator(&scripted_config());
    let run = sim
        .run_instrument(&scripted_series("BE", &bars), &WeightVector::default())
        .unwrap();
    let trade = &run.trades[0];
    let reasons: Vec<ExitReason> = trade.exits.iter().map(|e| e.reason).collect();
    assert_eq!(reasons, vec![ExitReason::Target1, ExitReason::BreakevenStop]);

    let last = trade.exits.last().unwrap();
    assert_eq!(last.price, trade.entry_price);
    assert_eq!(last.pnl, Decimal::ZERO);
    assert_eq!(trade.total_fraction(), Decimal::ONE);
    assert!(!trade.forced_close);
}

#[test]
fn test_full_ladder_then_forced_close() {
    let sim = simulator(&scripted_config());
    let report = sim.run(&[scripted_series("LADDER", &grind_to_t2())], &WeightVector::default());

    let trade = &report.trades[0];
    let reasons: Vec<ExitReason> = trade.exits.iter().map(|e| e.reason).collect();
    assert_eq!(
        reasons,
        vec![ExitReason::Target1, ExitReason::Target2, ExitReason::EndOfData]
    );
    assert_eq!(trade.total_fraction(), Decimal::ONE);
    assert!(trade.forced_close);
    assert!(trade.is_win());
    assert_eq!(report.stats.forced_closes, 1);
    assert_eq!(report.stats.wins, 1);

    // T2 and the forced close share the last bar: one equity point
    let last_bar = ts(60);
    assert_eq!(
        report.equity_curve.iter().filter(|p| p.timestamp == last_bar).count(),
        1
    );
    assert!(report
        .equity_curve
        .windows(2)
        .all(|w| w[0].timestamp < w[1].timestamp));
    assert_eq!(
        report.stats.final_equity,
        report.initial_capital + trade.realized_pnl
    );
}

#[test]
fn test_gap_through_stop_fills_at_open() {
    let sim = simulator(&scripted_config());
    let bars = [(97.0, 97.5, 96.0, 96.5)];
    let report = sim.run(&[scripted_series("GAP", &bars)], &WeightVector::default());

    let trade = &report.trades[0];
    assert_eq!(trade.exits.len(), 1);
    assert_eq!(trade.exits[0].reason, ExitReason::StopLoss);
    assert_eq!(trade.exits[0].price, Decimal::from(97));
    assert_eq!(trade.realized_pnl, Decimal::from(-300));
    assert_eq!(report.stats.losses, 1);
    assert_eq!(report.stats.profit_factor, Some(0.0));
    assert!(report.stats.max_drawdown > 0.0);
}

/// Ledger columns read back as text so decimals keep full precision
#[derive(Debug, Deserialize)]
struct LedgerText {
    trade_id: u64,
    exit_reason: String,
    fraction: String,
    realized_pnl: String,
    forced_close: bool,
}

#[test]
fn test_ledger_csv_export() {
    let sim = simulator(&scripted_config());
    let report = sim.run(&[scripted_series("LEDGER", &grind_to_t2())], &WeightVector::default());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.csv");
    report.export_ledger(&path).unwrap();

    let mut reader = csv::Reader::from_path(&path).unwrap();
    let rows: Vec<LedgerText> = reader.deserialize().map(|r| r.unwrap()).collect();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].exit_reason, "target_1");
    assert_eq!(rows[2].exit_reason, "end_of_data");
    assert!(rows.iter().all(|r| r.trade_id == 1 && r.forced_close));

    let fractions: Decimal = rows.iter().map(|r| Decimal::from_str(&r.fraction).unwrap()).sum();
    assert_eq!(fractions, Decimal::ONE);
    let pnl: Decimal = rows
        .iter()
        .map(|r| Decimal::from_str(&r.realized_pnl).unwrap())
        .sum();
    assert_eq!(pnl, report.trades[0].realized_pnl);
}

#[test]
fn test_short_history_is_skipped() {
    let config = scripted_config();
    let sim = simulator(&config);
    let short = PreparedSeries::from_parts(
        "SHORT".into(),
        flat_candles(20, 100.0),
        (0..20).map(|_| silent_snapshot(100.0)).collect(),
    )
    .unwrap();

    let report = sim.run(
        &[short, scripted_series("OK", &grind_to_t2())],
        &WeightVector::default(),
    );
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].instrument, "SHORT");
    assert_eq!(report.trades.len(), 1);
}

#[tokio::test]
async fn test_scan_ranks_and_skips() {
    let config = scripted_config();
    let universe = Arc::new(vec![
        // Ends on the signal bar
        scripted_series("READY", &[]),
        scripted_series("QUIET", &grind_to_t2()),
        PreparedSeries::from_parts(
            "TINY".into(),
            flat_candles(5, 100.0),
            (0..5).map(|_| silent_snapshot(100.0)).collect(),
        )
        .unwrap(),
    ]);

    let scanner = UniverseScanner::new(pipeline(&config), 2);
    let active = ActiveWeights::default();
    let report = scanner.scan_active(universe, &active).await;

    assert_eq!(report.signals.len(), 2);
    assert_eq!(report.signals[0].instrument, "READY");
    assert_eq!(report.signals[0].recommendation, Recommendation::StrongBuy);
    assert_eq!(report.signals[1].recommendation, Recommendation::Reject);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].instrument, "TINY");

    let actionable: Vec<&str> = report
        .actionable(config.simulator.entry_threshold)
        .map(|s| s.instrument.as_str())
        .collect();
    assert_eq!(actionable, vec!["READY"]);
}

#[tokio::test]
async fn test_optimizer_on_synthetic_history() {
    let config = scripted_config();
    let dataset = synthetic_dataset(3, 200, 11);
    let universe = Arc::new(prepare_universe(&dataset, &StandardIndicators));
    assert_eq!(universe.len(), 3);

    let optimizer_config = OptimizerConfig {
        population_size: 10,
        generations: 5,
        workers: 2,
        seed: Some(42),
        fitness: FitnessMetric::Composite,
        ..Default::default()
    };

    let run = || {
        let evaluator = BacktestFitness::new(
            simulator(&config),
            Arc::clone(&universe),
            FitnessMetric::Composite,
            optimizer_config.sharpe_cap,
        );
        GeneticOptimizer::new(optimizer_config.clone(), Arc::new(evaluator)).unwrap()
    };

    let first = run().run().await.unwrap();
    assert_eq!(first.history.len(), 5);
    assert_eq!(first.stop_reason, StopReason::Completed);
    assert!(first.history.windows(2).all(|w| w[1] >= w[0]));
    assert!((first.best_weights.sum() - 1.0).abs() <= SIMPLEX_TOLERANCE);
    assert!((0.0..=1.0).contains(&first.best_fitness));

    let bounds = optimizer_config.bounds.as_array();
    for (w, b) in first.best_weights.as_array().iter().zip(bounds.iter()) {
        assert!(*w >= b.min - 1e-9 && *w <= b.max + 1e-9);
    }

    let second = run().run().await.unwrap();
    assert_eq!(first.best_weights, second.best_weights);
    assert_eq!(first.history, second.history);

    let active = ActiveWeights::default();
    active.promote(first.best_weights);
    assert_eq!(*active.snapshot(), first.best_weights);
}

#[test]
fn test_allocation_from_backtests() {
    let config = scripted_config();
    let sim = simulator(&config);
    let universe = vec![
        scripted_series("WINNER", &grind_to_t2()),
        scripted_series("LOSER", &[(97.0, 97.5, 96.0, 96.5)]),
    ];
    let names: Vec<String> = universe.iter().map(|s| s.instrument.clone()).collect();

    let (candidates, correlation) =
        candidates_from_backtest(&sim, &universe, &names, &WeightVector::default());
    assert_eq!(candidates.len(), 2);
    assert_eq!(correlation.len(), 2);

    let allocation = PortfolioAllocator::new(config.portfolio.clone())
        .allocate(&candidates, &correlation)
        .unwrap();
    // A single trade never gives both an average win and an average loss
    assert!(allocation.positions.is_empty());
    assert_eq!(allocation.dropped.len(), 2);
    assert_eq!(allocation.total_fraction, 0.0);
}
