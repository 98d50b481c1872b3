// src/control/mod.rs
//
// Decision core.
//
// Signal flow:
//   DirectionCounts -> features -> history -> forecaster ─┐
//                                        EmergencyManager ─┼→ engine → PhaseAction
//                                                  policy ─┘

pub mod cache;
pub mod engine;
pub mod features;
pub mod history;
pub mod models;

pub use cache::{InputCache, TtlCache};
pub use engine::{
    Decision, DecisionEngine, DecisionMetrics, DecisionSource, EngineMode, TickInput,
};
pub use features::{build_features, FeatureVector, TickTime, FEATURE_COUNT};
pub use history::HistoryBuffer;
pub use models::{
    Forecaster, LinearQPolicy, ModelBundle, Policy, PressurePolicy, TrendForecaster,
};
