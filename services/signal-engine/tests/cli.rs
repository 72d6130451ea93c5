//! Command-line runs against a generated dataset
//!
//! stdout must stay machine-readable: results only, logs on stderr.


use fixtures::*;
use std::path::Path;
use std::process::{Command, Output};

use signal_engine::{backtest::report::SummaryStats, optimizer::OptimizationResult, BestWeightsRecord};

fn signal_engine(args: &[&str], cwd: &Path) -> Output {
    let output = Command::new(env!("CARGO_BIN_EXE_signal-engine"))
        .args(args)
        .current_dir(cwd)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "exit {:?}: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );
    output
}

#[test]
fn test_backtest_prints_only_json() {
    let dir = tempfile::tempdir().unwrap();
    let dataset = dir.path().join("history.json");
    write_dataset(&synthetic_dataset(2, 120, 5), &dataset);

    let output = signal_engine(
        &["backtest", "--dataset", dataset.to_str().unwrap()],
        dir.path(),
    );
    let stats: SummaryStats = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(stats.total_trades, stats.wins + stats.losses);
    assert!(String::from_utf8_lossy(&output.stderr).contains("Starting Signal Engine"));
}

#[test]
fn test_optimize_saves_the_printed_result() {
    let dir = tempfile::tempdir().unwrap();
    let dataset = dir.path().join("history.json");
    let best = dir.path().join("best.json");
    write_dataset(&synthetic_dataset(2, 120, 9), &dataset);

    let output = signal_engine(
        &[
            "optimize",
            "--dataset",
            dataset.to_str().unwrap(),
            "--population",
            "4",
            "--generations",
            "2",
            "--seed",
            "7",
            "--workers",
            "1",
            "--output",
            best.to_str().unwrap(),
        ],
        dir.path(),
    );
    let result: OptimizationResult = serde_json::from_slice(&output.stdout).unwrap();
    assert!((1..=2).contains(&result.generations_run));

    let record: BestWeightsRecord = serde_json::from_str(&std::fs::read_to_string(&best).unwrap()).unwrap();
    assert_eq!(record.best_weights, result.best_weights);
    assert_eq!(record.fitness_history, result.history);
    assert_eq!(record.generations_run, result.generations_run);
}
