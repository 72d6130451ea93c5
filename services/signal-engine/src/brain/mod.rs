//! Brain module - signal scoring
//!
//! Confirmation votes, classifier confidence and entry timing are fused
//! with the active weight vector into one integrated signal per bar.

pub mod classifier;
pub mod confirmation;
pub mod entry_timing;
pub mod integrator;
pub mod signal;

// Re-export main types for convenience
pub use classifier::{
    load_classifier, ConfidenceModel, FeatureVector, HeuristicClassifier, LogisticModel,
    TrainedClassifier, TrainingSample,
};
pub use confirmation::{
    ConfirmationAggregator, ConfirmationResult, ConfirmationSource, VolatilityRegime, Vote,
};
pub use entry_timing::{EntryTiming, EntryTimingScorer};
pub use integrator::{ScoringPipeline, WeightedIntegrator};
pub use signal::{ComponentScores, ConfidenceLabel, IntegratedSignal, Recommendation};
