// src/lib.rs
//
// Traffic signal decision core for a single junction.
//
// Leaf-first: types/config → control (features, history, models, engine)
// → emergency, alerts, violations → simulation step loop → pipeline
// (control loop, events, metrics, status).

pub mod alerts;
pub mod config;
pub mod control;
pub mod emergency;
pub mod pipeline;
pub mod simulation;
pub mod types;
pub mod violations;

mod sync;

pub use pipeline::{ControlLoop, TrafficCore};
pub use types::{Config, Direction, DirectionCounts, PhaseAction};
