//! Realistic trade simulator
//!
//! Walks every instrument's bars in time order, opening on integrated signals
//! and managing the staged exit plan. All instruments draw on one capital
//! book, so open positions never commit more than the running capital.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backtest::position::{CostModel, EntryOrder, ExitReason, OpenPosition, Stage, Trade};
use crate::backtest::report::{BacktestReport, PnlEvent, SkippedInstrument};
use crate::brain::ScoringPipeline;
use crate::config::{SimulatorConfig, StopBasis};
use crate::errors::{EngineError, Result};
use crate::indicators::PreparedSeries;
use crate::weights::WeightVector;

/// Trades and P&L events from one instrument walk
#[derive(Debug, Clone, Default)]
pub struct InstrumentRun {
    pub trades: Vec<Trade>,
    pub events: Vec<PnlEvent>,
}

/// Capital shared by every position in a run
#[derive(Debug, Clone, Copy)]
struct CapitalBook {
    /// Initial capital plus realized P&L
    equity: Decimal,
    /// Entry notional held by open positions
    committed: Decimal,
}

impl CapitalBook {
    fn new(initial_capital: Decimal) -> Self {
        Self {
            equity: initial_capital,
            committed: Decimal::ZERO,
        }
    }

    fn available(&self) -> Decimal {
        (self.equity - self.committed).max(Decimal::ZERO)
    }
}

/// Cursor over one instrument's bars
struct Walk<'a> {
    series: &'a PreparedSeries,
    cursor: usize,
    position: Option<OpenPosition>,
    next_id: u64,
    run: InstrumentRun,
}

impl<'a> Walk<'a> {
    fn next_timestamp(&self) -> Option<DateTime<Utc>> {
        self.series.candles.get(self.cursor).map(|c| c.timestamp)
    }

    fn record(&mut self, timestamp: DateTime<Utc>, pnl: Decimal) {
        self.run.events.push(PnlEvent {
            timestamp,
            instrument: self.series.instrument.clone(),
            pnl,
        });
    }
}

/// Replays history through the scoring pipeline
#[derive(Debug, Clone)]
pub struct TradeSimulator {
    pipeline: Arc<ScoringPipeline>,
    config: SimulatorConfig,
    costs: CostModel,
}

impl TradeSimulator {
    pub fn new(pipeline: Arc<ScoringPipeline>, config: SimulatorConfig) -> Self {
        let costs = CostModel::from_bps(config.slippage_bps, config.commission_bps)
            .with_atr_slippage(config.atr_slippage_factor, config.max_slippage_bps);
        Self {
            pipeline,
            config,
            costs,
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Backtest a universe with one weight vector.
    ///
    /// Instruments with too little history are skipped and listed in the report.
    pub fn run(&self, universe: &[PreparedSeries], weights: &WeightVector) -> BacktestReport {
        let mut walks = Vec::with_capacity(universe.len());
        let mut skipped = Vec::new();

        for series in universe {
            match self.walk(series) {
                Ok(walk) => walks.push(walk),
                Err(e) => {
                    debug!(instrument = %series.instrument, kind = %e.kind(), "Skipping instrument: {}", e);
                    skipped.push(SkippedInstrument {
                        instrument: series.instrument.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.replay(&mut walks, weights);

        let mut trades = Vec::new();
        let mut events = Vec::new();
        for walk in walks {
            trades.extend(walk.run.trades);
            events.extend(walk.run.events);
        }

        let start = universe
            .iter()
            .filter_map(|s| s.candles.first().map(|c| c.timestamp))
            .min();

        BacktestReport::build(trades, events, self.config.initial_capital, start, skipped)
    }

    /// Walk one instrument on its own, with the whole capital book to itself
    pub fn run_instrument(&self, series: &PreparedSeries, weights: &WeightVector) -> Result<InstrumentRun> {
        let mut walk = self.walk(series)?;
        self.replay(std::slice::from_mut(&mut walk), weights);
        Ok(walk.run)
    }

    fn walk<'a>(&self, series: &'a PreparedSeries) -> Result<Walk<'a>> {
        let min_bars = self.pipeline.min_bars().max(1);
        if series.len() < min_bars {
            return Err(EngineError::insufficient(
                &series.instrument,
                format!("{} bars, need {}", series.len(), min_bars),
            ));
        }
        Ok(Walk {
            series,
            cursor: min_bars - 1,
            position: None,
            next_id: 1,
            run: InstrumentRun::default(),
        })
    }

    /// Advance the walks bar by bar in time order; ties go to universe order
    fn replay(&self, walks: &mut [Walk<'_>], weights: &WeightVector) {
        let mut book = CapitalBook::new(self.config.initial_capital);
        loop {
            let next = walks
                .iter()
                .enumerate()
                .filter_map(|(i, w)| w.next_timestamp().map(|t| (t, i)))
                .min();
            let i = match next {
                Some((_, i)) => i,
                None => break,
            };
            self.step(&mut walks[i], &mut book, weights);
        }

        for walk in walks.iter() {
            info!(
                instrument = %walk.series.instrument,
                trades = walk.run.trades.len(),
                "Simulated instrument"
            );
        }
    }

    /// Process the walk's next bar
    fn step(&self, walk: &mut Walk<'_>, book: &mut CapitalBook, weights: &WeightVector) {
        let index = walk.cursor;
        walk.cursor += 1;
        let series = walk.series;

        if let Some(pos) = walk.position.as_mut() {
            let held = pos.committed_notional();
            let realized = self.manage(pos, series, index);
            book.committed -= held - pos.committed_notional();
            let closed = pos.is_closed();
            for (timestamp, pnl) in realized {
                book.equity += pnl;
                walk.record(timestamp, pnl);
            }
            if closed {
                if let Some(done) = walk.position.take() {
                    walk.run.trades.push(done.into_trade());
                }
            }
            // No re-entry on the bar that closed a position
        } else {
            self.try_enter(walk, index, book, weights);
        }

        if walk.cursor == series.len() {
            self.force_close(walk, book);
        }
    }

    fn try_enter(&self, walk: &mut Walk<'_>, index: usize, book: &mut CapitalBook, weights: &WeightVector) {
        let series = walk.series;
        let signal = match self.pipeline.score_at(series, index, weights) {
            Ok(signal) => signal,
            Err(e) => {
                debug!(instrument = %series.instrument, "Bar {} not scored: {}", index, e);
                return;
            }
        };
        if !signal.is_actionable(self.config.entry_threshold) {
            return;
        }

        match self.entry_order(series, index, book, signal.final_score) {
            Some(order) => {
                let pos = OpenPosition::open(walk.next_id, order, self.costs);
                book.committed += pos.committed_notional();
                walk.position = Some(pos);
                walk.next_id += 1;
            }
            None => debug!(
                instrument = %series.instrument,
                "Signal at {} not sized (equity {}, available {})",
                series.candles[index].timestamp,
                book.equity,
                book.available()
            ),
        }
    }

    /// Data exhausted with a position still open
    fn force_close(&self, walk: &mut Walk<'_>, book: &mut CapitalBook) {
        let series = walk.series;
        if let Some(mut pos) = walk.position.take() {
            let last = &series.candles[series.len() - 1];
            let divergence = EngineError::SimulationDivergence {
                instrument: series.instrument.clone(),
                trade_id: pos.trade().id,
            };
            warn!(kind = %divergence.kind(), "{}; forcing close at {}", divergence, last.close);
            book.committed -= pos.committed_notional();
            let pnl = pos.close_remaining(last.timestamp, last.close, ExitReason::EndOfData);
            book.equity += pnl;
            walk.record(last.timestamp, pnl);
            walk.run.trades.push(pos.into_trade());
        }
    }

    /// Size a new position from the signal bar. `None` when it cannot be sized.
    ///
    /// One R is `risk_per_trade` of equity; the entry notional is capped at
    /// `max_position_fraction` of equity and at the capital not yet committed.
    fn entry_order(
        &self,
        series: &PreparedSeries,
        index: usize,
        book: &CapitalBook,
        score: f64,
    ) -> Option<EntryOrder> {
        let candle = &series.candles[index];
        let snap = &series.snapshots[index];
        let raw_price = candle.close;
        let equity = book.equity;
        if raw_price <= Decimal::ZERO || equity <= Decimal::ZERO {
            return None;
        }

        let percent_distance =
            raw_price * Decimal::from_f64(self.config.stop_pct)? / Decimal::from(100);
        let stop_distance = match (self.config.stop_basis, snap.atr) {
            (StopBasis::Atr, Some(atr)) if atr > 0.0 => {
                Decimal::from_f64(atr * self.config.stop_atr_multiple)?
            }
            _ => percent_distance,
        };
        if stop_distance <= Decimal::ZERO || stop_distance >= raw_price {
            return None;
        }

        let risk_amount = equity * self.config.risk_per_trade;
        let entry_price = self.costs.entry_price(raw_price, snap.atr);
        let notional_cap = (equity * self.config.max_position_fraction).min(book.available());
        let quantity = (risk_amount / stop_distance).min(notional_cap / entry_price);
        if quantity <= Decimal::ZERO {
            return None;
        }

        Some(EntryOrder {
            instrument: series.instrument.clone(),
            timestamp: candle.timestamp,
            raw_price,
            quantity,
            stop_distance,
            t1_r: self.config.t1_r,
            t2_r: self.config.t2_r,
            t3_r: self.config.t3_r,
            t1_fraction: self.config.t1_exit_fraction,
            t2_fraction: self.config.t2_exit_fraction,
            atr: snap.atr,
            entry_score: score,
            entry_features: self.pipeline.features_at(series, index).unwrap_or_default(),
        })
    }

    /// Advance an open position through one bar, returning realized fills
    fn manage(
        &self,
        pos: &mut OpenPosition,
        series: &PreparedSeries,
        index: usize,
    ) -> Vec<(DateTime<Utc>, Decimal)> {
        let candle = &series.candles[index];
        let ts = candle.timestamp;
        let mut realized = Vec::new();
        pos.observe_bar(candle.high, candle.low, series.snapshots[index].atr);

        // Stop first: a bar that trades through both is assumed stopped
        if candle.low <= pos.stop() {
            let fill = if candle.open < pos.stop() { candle.open } else { pos.stop() };
            let reason = pos.stop_reason();
            realized.push((ts, pos.close_remaining(ts, fill, reason)));
            return realized;
        }

        let targets = pos.trade().targets;
        if pos.stage() == Stage::Initial && candle.high >= targets.t1 {
            realized.push((ts, pos.take_target1(ts)));
        }
        if pos.stage() == Stage::Target1Hit && candle.high >= targets.t2 {
            realized.push((ts, pos.take_target2(ts)));
        }
        if pos.stage() == Stage::Target2Hit && candle.high >= targets.t3 {
            realized.push((ts, pos.close_remaining(ts, targets.t3, ExitReason::Target3)));
            return realized;
        }

        if pos.trade().bars_held >= self.config.max_hold_bars {
            realized.push((ts, pos.close_remaining(ts, candle.close, ExitReason::MaxHold)));
            return realized;
        }

        if pos.stage() == Stage::Target2Hit {
            let distance = series.snapshots[index]
                .atr
                .and_then(|atr| Decimal::from_f64(atr * self.config.trail_atr_multiple))
                .unwrap_or(pos.trade().risk_per_unit);
            pos.trail(distance);
        }
        realized
    }
}
