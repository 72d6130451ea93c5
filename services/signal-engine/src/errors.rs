//! Error taxonomy for scoring, simulation and optimization

use serde::{Deserialize, Serialize};

/// Error types for the signal engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Insufficient data for {instrument}: {reason}")]
    DataInsufficient { instrument: String, reason: String },

    #[error("Classifier unavailable: {0}")]
    ClassifierUnavailable(String),

    #[error("Position in {instrument} still open at end of data (trade {trade_id})")]
    SimulationDivergence { instrument: String, trade_id: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Fitness evaluation failed: {0}")]
    Evaluation(String),
}

/// Machine-readable failure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    DataInsufficient,
    ClassifierUnavailable,
    SimulationDivergence,
    Io,
    Serialization,
    Evaluation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::DataInsufficient => "data_insufficient",
            ErrorKind::ClassifierUnavailable => "classifier_unavailable",
            ErrorKind::SimulationDivergence => "simulation_divergence",
            ErrorKind::Io => "io",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Evaluation => "evaluation",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Configuration(msg.into())
    }

    pub fn insufficient(instrument: &str, reason: impl Into<String>) -> Self {
        EngineError::DataInsufficient {
            instrument: instrument.to_string(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Configuration(_) => ErrorKind::Configuration,
            EngineError::DataInsufficient { .. } => ErrorKind::DataInsufficient,
            EngineError::ClassifierUnavailable(_) => ErrorKind::ClassifierUnavailable,
            EngineError::SimulationDivergence { .. } => ErrorKind::SimulationDivergence,
            EngineError::Io(_) => ErrorKind::Io,
            EngineError::Serialization(_) => ErrorKind::Serialization,
            EngineError::Evaluation(_) => ErrorKind::Evaluation,
        }
    }

    /// Whether a batch run should skip the failing item and carry on
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, EngineError::Configuration(_))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<csv::Error> for EngineError {
    fn from(e: csv::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(e: config::ConfigError) -> Self {
        EngineError::Configuration(e.to_string())
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
