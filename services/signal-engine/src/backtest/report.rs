//! Backtest report - equity curve, summary statistics and ledger export

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use tracing::info;

use crate::backtest::position::Trade;
use crate::brain::classifier::TrainingSample;
use crate::errors::Result;

/// Realized P&L at one fill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlEvent {
    pub timestamp: DateTime<Utc>,
    pub instrument: String,
    pub pnl: Decimal,
}

/// Realized capital at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
}

/// An instrument left out of the backtest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedInstrument {
    pub instrument: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    /// Fraction of trades with positive P&L
    pub win_rate: f64,
    pub avg_win: Decimal,
    /// Magnitude of the average losing trade
    pub avg_loss: Decimal,
    pub avg_win_pct: f64,
    pub avg_loss_pct: f64,
    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
    /// `None` when there were no losing trades
    pub profit_factor: Option<f64>,
    pub expectancy: Decimal,
    /// Mean over standard deviation of equity-step returns, annualized by sqrt(252)
    pub sharpe_ratio: f64,
    /// Largest peak-to-trough decline as a fraction of the peak
    pub max_drawdown: f64,
    pub total_return: f64,
    pub final_equity: Decimal,
    pub forced_closes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    pub initial_capital: Decimal,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub stats: SummaryStats,
    #[serde(default)]
    pub skipped: Vec<SkippedInstrument>,
}

impl BacktestReport {
    /// Merge per-instrument results into one report.
    ///
    /// Events are ordered by time; events sharing a timestamp collapse into a
    /// single equity point, so timestamps are strictly increasing.
    pub fn build(
        mut trades: Vec<Trade>,
        mut events: Vec<PnlEvent>,
        initial_capital: Decimal,
        start: Option<DateTime<Utc>>,
        skipped: Vec<SkippedInstrument>,
    ) -> Self {
        trades.sort_by(|a, b| {
            a.entry_time
                .cmp(&b.entry_time)
                .then_with(|| a.instrument.cmp(&b.instrument))
        });
        for (i, trade) in trades.iter_mut().enumerate() {
            trade.id = i as u64 + 1;
        }

        events.sort_by_key(|e| e.timestamp);
        let equity_curve = merge_equity(&events, initial_capital, start);
        let stats = summarize(&trades, &equity_curve, initial_capital);

        info!(
            trades = stats.total_trades,
            win_rate = stats.win_rate,
            final_equity = %stats.final_equity,
            "Backtest complete"
        );

        Self {
            initial_capital,
            trades,
            equity_curve,
            stats,
            skipped,
        }
    }

    /// One labelled sample per trade
    pub fn training_samples(&self) -> Vec<TrainingSample> {
        self.trades.iter().map(Trade::training_sample).collect()
    }

    /// Ledger rows, one per exit fill
    pub fn ledger(&self) -> Vec<LedgerRow> {
        self.trades
            .iter()
            .flat_map(|t| {
                t.exits.iter().map(move |e| LedgerRow {
                    trade_id: t.id,
                    instrument: t.instrument.clone(),
                    entry_time: t.entry_time,
                    entry_price: t.entry_price,
                    exit_time: e.timestamp,
                    exit_price: e.price,
                    quantity: e.quantity,
                    fraction: e.fraction,
                    realized_pnl: e.pnl,
                    exit_reason: e.reason.as_str().to_string(),
                    forced_close: t.forced_close,
                })
            })
            .collect()
    }

    pub fn write_ledger<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        for row in self.ledger() {
            wtr.serialize(row)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn export_ledger(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        self.write_ledger(file)?;
        info!("Wrote ledger ({} trades) to {}", self.trades.len(), path.display());
        Ok(())
    }
}

/// Tabular ledger row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRow {
    pub trade_id: u64,
    pub instrument: String,
    pub entry_time: DateTime<Utc>,
    pub entry_price: Decimal,
    pub exit_time: DateTime<Utc>,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub fraction: Decimal,
    pub realized_pnl: Decimal,
    pub exit_reason: String,
    pub forced_close: bool,
}

fn merge_equity(
    events: &[PnlEvent],
    initial_capital: Decimal,
    start: Option<DateTime<Utc>>,
) -> Vec<EquityPoint> {
    let mut curve: Vec<EquityPoint> = Vec::with_capacity(events.len() + 1);
    if let Some(start) = start {
        curve.push(EquityPoint {
            timestamp: start,
            equity: initial_capital,
        });
    }

    let mut equity = initial_capital;
    for event in events {
        equity += event.pnl;
        match curve.last_mut() {
            Some(last) if last.timestamp >= event.timestamp => last.equity = equity,
            _ => curve.push(EquityPoint {
                timestamp: event.timestamp,
                equity,
            }),
        }
    }
    curve
}

fn summarize(trades: &[Trade], curve: &[EquityPoint], initial_capital: Decimal) -> SummaryStats {
    let total_trades = trades.len();
    let winners: Vec<&Trade> = trades.iter().filter(|t| t.is_win()).collect();
    let losers: Vec<&Trade> = trades.iter().filter(|t| !t.is_win()).collect();
    let wins = winners.len();
    let losses = losers.len();

    let gross_profit: Decimal = winners.iter().map(|t| t.realized_pnl).sum();
    let gross_loss: Decimal = losers.iter().map(|t| -t.realized_pnl).sum();
    let avg_win = mean_decimal(gross_profit, wins);
    let avg_loss = mean_decimal(gross_loss, losses);
    let avg_win_pct = mean(winners.iter().map(|t| t.profit_pct));
    let avg_loss_pct = mean(losers.iter().map(|t| -t.profit_pct));

    let profit_factor = if gross_loss > Decimal::ZERO {
        (gross_profit / gross_loss).to_f64()
    } else {
        None
    };

    let net: Decimal = trades.iter().map(|t| t.realized_pnl).sum();
    let final_equity = curve.last().map(|p| p.equity).unwrap_or(initial_capital + net);
    let total_return = if initial_capital > Decimal::ZERO {
        ((final_equity - initial_capital) / initial_capital)
            .to_f64()
            .unwrap_or(0.0)
    } else {
        0.0
    };

    SummaryStats {
        total_trades,
        wins,
        losses,
        win_rate: if total_trades > 0 {
            wins as f64 / total_trades as f64
        } else {
            0.0
        },
        avg_win,
        avg_loss,
        avg_win_pct,
        avg_loss_pct,
        gross_profit,
        gross_loss,
        profit_factor,
        expectancy: mean_decimal(net, total_trades),
        sharpe_ratio: sharpe_ratio(curve),
        max_drawdown: max_drawdown(curve),
        total_return,
        final_equity,
        forced_closes: trades.iter().filter(|t| t.forced_close).count(),
    }
}

fn mean_decimal(total: Decimal, count: usize) -> Decimal {
    if count == 0 {
        Decimal::ZERO
    } else {
        total / Decimal::from(count as u64)
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// Annualized mean/std of step returns; 0 when undefined
pub fn sharpe_ratio(curve: &[EquityPoint]) -> f64 {
    let returns: Vec<f64> = curve
        .windows(2)
        .filter_map(|w| {
            let prev = w[0].equity.to_f64()?;
            let next = w[1].equity.to_f64()?;
            if prev > 0.0 {
                Some(next / prev - 1.0)
            } else {
                None
            }
        })
        .collect();
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let avg = returns.iter().sum::<f64>() / n;
    let var = returns.iter().map(|r| (r - avg).powi(2)).sum::<f64>() / (n - 1.0);
    let std = var.sqrt();
    if std > 0.0 && std.is_finite() {
        avg / std * 252f64.sqrt()
    } else {
        0.0
    }
}

/// Peak-to-trough decline as a fraction of the running peak
pub fn max_drawdown(curve: &[EquityPoint]) -> f64 {
    let mut peak = Decimal::MIN;
    let mut worst = 0.0;
    for point in curve {
        if point.equity > peak {
            peak = point.equity;
        }
        if peak > Decimal::ZERO {
            let dd = ((peak - point.equity) / peak).to_f64().unwrap_or(0.0);
            if dd > worst {
                worst = dd;
            }
        }
    }
    worst
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ts(day: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::days(day)
    }

    fn event(day: i64, instrument: &str, pnl: i64) -> PnlEvent {
        PnlEvent {
            timestamp: ts(day),
            instrument: instrument.into(),
            pnl: Decimal::from(pnl),
        }
    }

    #[test]
    fn test_same_bar_events_merge() {
        let events = vec![
            event(3, "A", 100),
            event(3, "B", -40),
            event(5, "A", 10),
        ];
        let curve = merge_equity(&events, Decimal::from(1000), Some(ts(0)));
        assert_eq!(curve.len(), 3);
        assert_eq!(curve[1].equity, Decimal::from(1060));
        assert_eq!(curve[2].equity, Decimal::from(1070));
        assert!(curve.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_drawdown_and_sharpe() {
        let curve: Vec<EquityPoint> = [100, 120, 90, 130]
            .iter()
            .enumerate()
            .map(|(i, e)| EquityPoint {
                timestamp: ts(i as i64),
                equity: Decimal::from(*e),
            })
            .collect();
        assert!((max_drawdown(&curve) - 0.25).abs() < 1e-12);
        assert!(sharpe_ratio(&curve) > 0.0);
        assert_eq!(sharpe_ratio(&curve[..2]), 0.0);
    }

    #[test]
    fn test_empty_report() {
        let report = BacktestReport::build(Vec::new(), Vec::new(), Decimal::from(5000), None, Vec::new());
        assert_eq!(report.stats.total_trades, 0);
        assert_eq!(report.stats.win_rate, 0.0);
        assert_eq!(report.stats.profit_factor, None);
        assert_eq!(report.stats.final_equity, Decimal::from(5000));
        assert!(report.equity_curve.is_empty());
    }
}
