//! Trade lifecycle - an open position with staged partial exits

use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::brain::classifier::{FeatureVector, TrainingSample};

/// Why a fill happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Target1,
    Target2,
    Target3,
    StopLoss,
    BreakevenStop,
    TrailingStop,
    MaxHold,
    /// Data ran out with the position still open
    EndOfData,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Target1 => "target_1",
            ExitReason::Target2 => "target_2",
            ExitReason::Target3 => "target_3",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::BreakevenStop => "breakeven_stop",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::MaxHold => "max_hold",
            ExitReason::EndOfData => "end_of_data",
        }
    }
}

/// Progress through the exit plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Full size, initial stop
    Initial,
    /// First partial closed, stop at breakeven
    Target1Hit,
    /// Second partial closed, stop at +1R and trailing
    Target2Hit,
    Closed,
}

/// Target prices and their R multiples
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetLevels {
    pub t1: Decimal,
    pub t2: Decimal,
    pub t3: Decimal,
    pub t1_r: f64,
    pub t2_r: f64,
    pub t3_r: f64,
}

/// Per-fill trading costs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostModel {
    /// Base slippage, also the floor when ATR scaling is on
    pub slippage_bps: Decimal,
    pub commission_bps: Decimal,
    /// Slippage per unit of ATR%; zero disables scaling
    pub atr_factor: f64,
    pub max_slippage_bps: Decimal,
}

impl CostModel {
    pub fn from_bps(slippage_bps: f64, commission_bps: f64) -> Self {
        let slippage_bps = Decimal::from_f64(slippage_bps).unwrap_or(Decimal::ZERO);
        Self {
            slippage_bps,
            commission_bps: Decimal::from_f64(commission_bps).unwrap_or(Decimal::ZERO),
            atr_factor: 0.0,
            max_slippage_bps: slippage_bps,
        }
    }

    /// Scale slippage with volatility: `factor × ATR%`, floored at the base and capped
    pub fn with_atr_slippage(mut self, factor: f64, max_slippage_bps: f64) -> Self {
        self.atr_factor = factor;
        self.max_slippage_bps = Decimal::from_f64(max_slippage_bps)
            .unwrap_or(self.slippage_bps)
            .max(self.slippage_bps);
        self
    }

    fn bps(value: Decimal) -> Decimal {
        value / Decimal::from(10_000)
    }

    /// Slippage in bps for a fill at `raw` on a bar with the given ATR
    pub fn slippage_at(&self, raw: Decimal, atr: Option<f64>) -> Decimal {
        let price = raw.to_f64().unwrap_or(0.0);
        let scaled = match atr {
            Some(atr) if self.atr_factor > 0.0 && atr > 0.0 && price > 0.0 => {
                Decimal::from_f64(atr * 10_000.0 * self.atr_factor / price)
            }
            _ => None,
        };
        match scaled {
            Some(bps) => bps.max(self.slippage_bps).min(self.max_slippage_bps),
            None => self.slippage_bps,
        }
    }

    /// Buy fills pay up
    pub fn entry_price(&self, raw: Decimal, atr: Option<f64>) -> Decimal {
        raw * (Decimal::ONE + Self::bps(self.slippage_at(raw, atr)))
    }

    /// Sell fills give up
    pub fn exit_price(&self, raw: Decimal, atr: Option<f64>) -> Decimal {
        raw * (Decimal::ONE - Self::bps(self.slippage_at(raw, atr)))
    }

    pub fn commission(&self, price: Decimal, quantity: Decimal) -> Decimal {
        price * quantity * Self::bps(self.commission_bps)
    }
}

/// One exit fill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitFill {
    pub timestamp: DateTime<Utc>,
    /// Fill price after slippage
    pub price: Decimal,
    /// Share of the original position size
    pub fraction: Decimal,
    pub quantity: Decimal,
    pub commission: Decimal,
    /// Net of this fill's commission and its share of the entry commission
    pub pnl: Decimal,
    pub reason: ExitReason,
}

/// A complete trade record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: u64,
    pub instrument: String,
    pub entry_time: DateTime<Utc>,
    /// Fill price after slippage
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub entry_commission: Decimal,
    pub initial_stop: Decimal,
    /// One R: entry minus initial stop
    pub risk_per_unit: Decimal,
    pub targets: TargetLevels,
    pub exits: Vec<ExitFill>,
    pub realized_pnl: Decimal,
    /// Realized P&L as a percent of entry notional
    pub profit_pct: f64,
    /// Maximum favorable excursion, percent of entry
    pub mfe_pct: f64,
    /// Maximum adverse excursion, percent of entry (non-positive)
    pub mae_pct: f64,
    pub bars_held: usize,
    /// Closed only because data ran out
    pub forced_close: bool,
    pub entry_score: f64,
    pub entry_features: FeatureVector,
}

impl Trade {
    pub fn is_win(&self) -> bool {
        self.realized_pnl > Decimal::ZERO
    }

    pub fn exit_time(&self) -> Option<DateTime<Utc>> {
        self.exits.last().map(|e| e.timestamp)
    }

    pub fn total_fraction(&self) -> Decimal {
        self.exits.iter().map(|e| e.fraction).sum()
    }

    /// Labelled sample for classifier training
    pub fn training_sample(&self) -> TrainingSample {
        TrainingSample {
            features: self.entry_features,
            profit_pct: self.profit_pct,
        }
    }
}

/// Parameters for opening a position
#[derive(Debug, Clone)]
pub struct EntryOrder {
    pub instrument: String,
    pub timestamp: DateTime<Utc>,
    pub raw_price: Decimal,
    pub quantity: Decimal,
    pub stop_distance: Decimal,
    pub t1_r: f64,
    pub t2_r: f64,
    pub t3_r: f64,
    /// Shares of the original size closed at T1 and T2
    pub t1_fraction: Decimal,
    pub t2_fraction: Decimal,
    /// ATR on the signal bar, for slippage
    pub atr: Option<f64>,
    pub entry_score: f64,
    pub entry_features: FeatureVector,
}

/// Mutable state of an open position
#[derive(Debug, Clone)]
pub struct OpenPosition {
    trade: Trade,
    stage: Stage,
    stop: Decimal,
    remaining: Decimal,
    highest_high: Decimal,
    lowest_low: Decimal,
    t1_fraction: Decimal,
    t2_fraction: Decimal,
    /// ATR of the bar being processed
    bar_atr: Option<f64>,
    costs: CostModel,
}

impl OpenPosition {
    /// Open at the signal bar's close
    pub fn open(id: u64, order: EntryOrder, costs: CostModel) -> Self {
        let entry_price = costs.entry_price(order.raw_price, order.atr);
        let r = order.stop_distance;
        let at_r = |multiple: f64| entry_price + r * Decimal::from_f64(multiple).unwrap_or(Decimal::ZERO);
        let targets = TargetLevels {
            t1: at_r(order.t1_r),
            t2: at_r(order.t2_r),
            t3: at_r(order.t3_r),
            t1_r: order.t1_r,
            t2_r: order.t2_r,
            t3_r: order.t3_r,
        };
        let stop = entry_price - r;

        debug!(
            instrument = %order.instrument,
            "Opened position: qty {} @ {} | stop {} | T1 {} T2 {} T3 {}",
            order.quantity, entry_price, stop, targets.t1, targets.t2, targets.t3
        );

        Self {
            trade: Trade {
                id,
                instrument: order.instrument,
                entry_time: order.timestamp,
                entry_price,
                quantity: order.quantity,
                entry_commission: costs.commission(entry_price, order.quantity),
                initial_stop: stop,
                risk_per_unit: r,
                targets,
                exits: Vec::new(),
                realized_pnl: Decimal::ZERO,
                profit_pct: 0.0,
                mfe_pct: 0.0,
                mae_pct: 0.0,
                bars_held: 0,
                forced_close: false,
                entry_score: order.entry_score,
                entry_features: order.entry_features,
            },
            stage: Stage::Initial,
            stop,
            remaining: order.quantity,
            highest_high: entry_price,
            lowest_low: entry_price,
            t1_fraction: order.t1_fraction,
            t2_fraction: order.t2_fraction,
            bar_atr: order.atr,
            costs,
        }
    }

    pub fn trade(&self) -> &Trade {
        &self.trade
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn stop(&self) -> Decimal {
        self.stop
    }

    pub fn remaining(&self) -> Decimal {
        self.remaining
    }

    /// Entry notional still held
    pub fn committed_notional(&self) -> Decimal {
        self.trade.entry_price * self.remaining
    }

    pub fn is_closed(&self) -> bool {
        self.stage == Stage::Closed
    }

    /// Count a bar and track excursions
    pub fn observe_bar(&mut self, high: Decimal, low: Decimal, atr: Option<f64>) {
        self.trade.bars_held += 1;
        self.bar_atr = atr;
        if high > self.highest_high {
            self.highest_high = high;
        }
        if low < self.lowest_low {
            self.lowest_low = low;
        }
        let entry = self.trade.entry_price;
        if entry > Decimal::ZERO {
            self.trade.mfe_pct = pct(self.highest_high - entry, entry);
            self.trade.mae_pct = pct(self.lowest_low - entry, entry).min(0.0);
        }
    }

    pub fn highest_high(&self) -> Decimal {
        self.highest_high
    }

    /// Stop that applies in the current stage
    pub fn stop_reason(&self) -> ExitReason {
        match self.stage {
            Stage::Initial => ExitReason::StopLoss,
            Stage::Target1Hit => ExitReason::BreakevenStop,
            _ => ExitReason::TrailingStop,
        }
    }

    /// Close the T1 share and move the stop to breakeven
    pub fn take_target1(&mut self, timestamp: DateTime<Utc>) -> Decimal {
        let price = self.trade.targets.t1;
        let pnl = self.partial(timestamp, price, self.t1_fraction, ExitReason::Target1);
        self.stop = self.trade.entry_price;
        self.stage = Stage::Target1Hit;
        pnl
    }

    /// Close the T2 share and lock in +1R
    pub fn take_target2(&mut self, timestamp: DateTime<Utc>) -> Decimal {
        let price = self.trade.targets.t2;
        let pnl = self.partial(timestamp, price, self.t2_fraction, ExitReason::Target2);
        self.stop = self.trade.entry_price + self.trade.risk_per_unit;
        self.stage = Stage::Target2Hit;
        pnl
    }

    /// Raise the stop to `highest high - distance`; never lowers it
    pub fn trail(&mut self, distance: Decimal) {
        if self.stage != Stage::Target2Hit {
            return;
        }
        let candidate = self.highest_high - distance;
        if candidate > self.stop {
            self.stop = candidate;
        }
    }

    fn partial(
        &mut self,
        timestamp: DateTime<Utc>,
        raw_price: Decimal,
        fraction: Decimal,
        reason: ExitReason,
    ) -> Decimal {
        let quantity = self.trade.quantity * fraction;
        self.fill(timestamp, raw_price, fraction, quantity, reason)
    }

    /// Close everything left. The final fraction is whatever remains of 1.
    pub fn close_remaining(
        &mut self,
        timestamp: DateTime<Utc>,
        raw_price: Decimal,
        reason: ExitReason,
    ) -> Decimal {
        let fraction = Decimal::ONE - self.trade.total_fraction();
        let quantity = self.remaining;
        let pnl = self.fill(timestamp, raw_price, fraction, quantity, reason);
        self.stage = Stage::Closed;
        self.remaining = Decimal::ZERO;
        if reason == ExitReason::EndOfData {
            self.trade.forced_close = true;
        }
        pnl
    }

    fn fill(
        &mut self,
        timestamp: DateTime<Utc>,
        raw_price: Decimal,
        fraction: Decimal,
        quantity: Decimal,
        reason: ExitReason,
    ) -> Decimal {
        let price = self.costs.exit_price(raw_price, self.bar_atr);
        let commission = self.costs.commission(price, quantity);
        let pnl = quantity * (price - self.trade.entry_price)
            - commission
            - self.trade.entry_commission * fraction;

        self.remaining -= quantity;
        self.trade.realized_pnl += pnl;
        let notional = self.trade.entry_price * self.trade.quantity;
        if notional > Decimal::ZERO {
            self.trade.profit_pct = pct(self.trade.realized_pnl, notional);
        }
        self.trade.exits.push(ExitFill {
            timestamp,
            price,
            fraction,
            quantity,
            commission,
            pnl,
            reason,
        });

        debug!(
            instrument = %self.trade.instrument,
            reason = reason.as_str(),
            "Exit fill: {} @ {} | PnL {}",
            quantity, price, pnl
        );
        pnl
    }

    pub fn into_trade(self) -> Trade {
        self.trade
    }
}

fn pct(numerator: Decimal, denominator: Decimal) -> f64 {
    (numerator / denominator * Decimal::from(100))
        .to_f64()
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn order() -> EntryOrder {
        EntryOrder {
            instrument: "ETH".into(),
            timestamp: Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap(),
            raw_price: Decimal::from(100),
            quantity: Decimal::from(90),
            stop_distance: Decimal::from(2),
            t1_r: 1.5,
            t2_r: 2.5,
            t3_r: 4.0,
            t1_fraction: Decimal::ONE / Decimal::from(3),
            t2_fraction: Decimal::ONE / Decimal::from(3),
            atr: None,
            entry_score: 80.0,
            entry_features: FeatureVector::default(),
        }
    }

    fn free() -> CostModel {
        CostModel::from_bps(0.0, 0.0)
    }

    #[test]
    fn test_targets_in_r_multiples() {
        let pos = OpenPosition::open(1, order(), free());
        let t = pos.trade().targets;
        assert_eq!(t.t1, Decimal::from(103));
        assert_eq!(t.t2, Decimal::from(105));
        assert_eq!(t.t3, Decimal::from(108));
        assert_eq!(pos.stop(), Decimal::from(98));
    }

    #[test]
    fn test_fractions_sum_to_exactly_one() {
        let mut pos = OpenPosition::open(1, order(), CostModel::from_bps(10.0, 20.0));
        let ts = pos.trade().entry_time;
        pos.take_target1(ts);
        assert_eq!(pos.stop(), pos.trade().entry_price);
        pos.take_target2(ts);
        assert_eq!(pos.stop(), pos.trade().entry_price + Decimal::from(2));
        pos.close_remaining(ts, Decimal::from(104), ExitReason::TrailingStop);

        let trade = pos.into_trade();
        assert_eq!(trade.exits.len(), 3);
        assert_eq!(trade.total_fraction(), Decimal::ONE);
        let quantity: Decimal = trade.exits.iter().map(|e| e.quantity).sum();
        assert_eq!(quantity, trade.quantity);
        assert!(!trade.forced_close);
    }

    #[test]
    fn test_trailing_stop_only_ratchets_up() {
        let mut pos = OpenPosition::open(1, order(), free());
        let ts = pos.trade().entry_time;
        pos.trail(Decimal::from(1));
        assert_eq!(pos.stop(), Decimal::from(98), "no trailing before T2");

        pos.take_target1(ts);
        pos.take_target2(ts);
        pos.observe_bar(Decimal::from(110), Decimal::from(104), None);
        pos.trail(Decimal::from(3));
        assert_eq!(pos.stop(), Decimal::from(107));
        pos.observe_bar(Decimal::from(108), Decimal::from(106), None);
        pos.trail(Decimal::from(3));
        assert_eq!(pos.stop(), Decimal::from(107));
    }

    #[test]
    fn test_costs_reduce_pnl() {
        let mut free_pos = OpenPosition::open(1, order(), free());
        let mut costly = OpenPosition::open(2, order(), CostModel::from_bps(10.0, 20.0));
        let ts = free_pos.trade().entry_time;
        let a = free_pos.close_remaining(ts, Decimal::from(103), ExitReason::MaxHold);
        let b = costly.close_remaining(ts, Decimal::from(103), ExitReason::MaxHold);
        assert_eq!(a, Decimal::from(270));
        assert!(b < a);
    }

    #[test]
    fn test_atr_scaled_slippage_is_floored_and_capped() {
        let costs = CostModel::from_bps(10.0, 0.0).with_atr_slippage(0.3, 100.0);
        let price = Decimal::from(100);
        // ATR 2% of price: 0.3 × 2% = 60 bps
        assert_eq!(costs.slippage_at(price, Some(2.0)), Decimal::from(60));
        assert_eq!(costs.entry_price(price, Some(2.0)), Decimal::new(1006, 1));
        // Calm bar falls back to the base
        assert_eq!(costs.slippage_at(price, Some(0.1)), Decimal::from(10));
        assert_eq!(costs.slippage_at(price, None), Decimal::from(10));
        // Wild bar hits the ceiling
        assert_eq!(costs.slippage_at(price, Some(5.0)), Decimal::from(100));
        assert_eq!(costs.exit_price(price, Some(5.0)), Decimal::from(99));

        let fixed = CostModel::from_bps(10.0, 0.0);
        assert_eq!(fixed.slippage_at(price, Some(5.0)), Decimal::from(10));
    }

    #[test]
    fn test_custom_exit_fractions() {
        let mut custom = order();
        custom.t1_fraction = Decimal::new(5, 1);
        custom.t2_fraction = Decimal::new(25, 2);
        let mut pos = OpenPosition::open(1, custom, free());
        let ts = pos.trade().entry_time;

        let t1 = pos.take_target1(ts);
        assert_eq!(t1, Decimal::from(135));
        assert_eq!(pos.committed_notional(), Decimal::from(4500));
        pos.take_target2(ts);
        pos.close_remaining(ts, Decimal::from(106), ExitReason::TrailingStop);

        let trade = pos.into_trade();
        let fractions: Vec<Decimal> = trade.exits.iter().map(|e| e.fraction).collect();
        assert_eq!(fractions, vec![Decimal::new(5, 1), Decimal::new(25, 2), Decimal::new(25, 2)]);
        assert_eq!(trade.total_fraction(), Decimal::ONE);
    }

    #[test]
    fn test_end_of_data_flags_forced_close() {
        let mut pos = OpenPosition::open(7, order(), free());
        let ts = pos.trade().entry_time;
        pos.observe_bar(Decimal::from(101), Decimal::from(99), None);
        pos.close_remaining(ts, Decimal::from(100), ExitReason::EndOfData);
        let trade = pos.into_trade();
        assert!(trade.forced_close);
        assert_eq!(trade.exits[0].fraction, Decimal::ONE);
        assert!(trade.mae_pct <= 0.0);
    }
}
