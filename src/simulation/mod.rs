// src/simulation/mod.rs

pub mod intersection;
pub mod manager;
pub mod queue_model;

pub use intersection::{is_emergency_type, Intersection, LaneOccupant};
pub use manager::{
    Connector, ControlError, EmergencyVehicle, LaneView, SimulationManager, StepMetrics,
};
pub use queue_model::{QueueIntersection, Scenario, ScriptedArrival};
