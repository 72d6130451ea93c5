//! Backtesting - trade lifecycle, simulator and reporting

pub mod position;
pub mod report;
pub mod simulator;

pub use position::{CostModel, EntryOrder, ExitFill, ExitReason, OpenPosition, Stage, TargetLevels, Trade};
pub use report::{BacktestReport, EquityPoint, LedgerRow, PnlEvent, SkippedInstrument, SummaryStats};
pub use simulator::{InstrumentRun, TradeSimulator};
