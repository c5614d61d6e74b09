#![deny(unreachable_pub)]

// Core modules
mod errors;
mod helpers;

// Domain model and the engine
pub mod engine;
pub mod types;

// Re-exports
pub use engine::classifier::{HeuristicScorer, Scorer, SignalClassifier, StochasticScorer};
pub use engine::config::{ConfigPatch, EngineConfig};
pub use engine::ledger::{AuditLog, MarginLedger, OptimizationFinding};
pub use engine::policy::{
    ConditionOp, MarginPolicy, PolicyAction, PolicyCondition, PolicyEngine, PolicyPass,
};
pub use engine::response::{
    AdaptiveResponseSelector, LearningEvent, ModelMetrics, Prediction, SelectorOutcome,
    SelectorSettings, StrategyKind,
};
pub use engine::sweeper::spawn_sweeper;
pub use engine::{
    EngineStatus, MarginOutcome, ProcessingError, ProcessingOutcome, ResilienceEngine,
};
pub use errors::{Error, Result};
pub use helpers::epoch_ms;
pub use types::*;
