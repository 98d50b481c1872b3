// src/simulation/intersection.rs
//
// Sensor/actuator seam to whatever runs the junction: a traffic simulator,
// a field controller, or the in-process queue model.

use crate::types::{Direction, DirectionCounts};
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// One vehicle on an approach lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneOccupant {
    pub id: String,
    #[serde(rename = "type")]
    pub vehicle_type: String,
    /// Distance to the stop line as a fraction of lane length, 0 = at the line.
    #[serde(rename = "pos")]
    pub relative_position: f64,
}

impl LaneOccupant {
    pub fn is_emergency(&self) -> bool {
        is_emergency_type(&self.vehicle_type)
    }
}

/// Case-insensitive match on the vehicle-type names simulators use for
/// priority vehicles.
pub fn is_emergency_type(vehicle_type: &str) -> bool {
    let t = vehicle_type.to_lowercase();
    ["emergency", "ambulance", "fire", "police"]
        .iter()
        .any(|k| t.contains(k))
}

/// Any call may fail; the step loop treats a failure as fatal for the run.
pub trait Intersection: Send {
    fn get_counts(&self) -> Result<DirectionCounts>;
    fn get_phase(&self) -> Result<u32>;
    fn set_phase(&mut self, phase: u32) -> Result<()>;
    fn advance_one_step(&mut self) -> Result<()>;
    /// Simulated seconds since the start of the run.
    fn sim_time(&self) -> Result<f64>;
    fn controlled_lanes(&self) -> Result<Vec<String>>;
    fn lane_occupants(&self, direction: Direction) -> Result<Vec<LaneOccupant>>;
    /// Total waiting seconds and halted vehicles over `lanes`.
    fn aggregate_wait_and_queue(&self, lanes: &[String]) -> Result<(f64, u32)>;
    /// Release the connection. Called once by `SimulationManager::stop`.
    fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emergency_type_match() {
        assert!(is_emergency_type("Ambulance"));
        assert!(is_emergency_type("FIRE_truck"));
        assert!(is_emergency_type("city_police_car"));
        assert!(is_emergency_type("emergency"));
        assert!(!is_emergency_type("passenger"));
        assert!(!is_emergency_type("bus"));
    }
}
