// src/types.rs

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

// ============================================================================
// DIRECTIONS & COUNTS
// ============================================================================

/// Approach of the intersection. Encounter order (North, South, East, West)
/// is significant: it breaks ties wherever an argmax over directions is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    North,
    South,
    East,
    West,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::North,
        Direction::South,
        Direction::East,
        Direction::West,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::North => "North",
            Self::South => "South",
            Self::East => "East",
            Self::West => "West",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Self::North => 0,
            Self::South => 1,
            Self::East => 2,
            Self::West => 3,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "North" => Ok(Self::North),
            "South" => Ok(Self::South),
            "East" => Ok(Self::East),
            "West" => Ok(Self::West),
            other => anyhow::bail!("Direction must be North, South, East, or West (got {other:?})"),
        }
    }
}

/// Vehicle count per approach for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirectionCounts {
    #[serde(rename = "North")]
    pub north: u32,
    #[serde(rename = "South")]
    pub south: u32,
    #[serde(rename = "East")]
    pub east: u32,
    #[serde(rename = "West")]
    pub west: u32,
}

impl DirectionCounts {
    pub fn new(north: u32, south: u32, east: u32, west: u32) -> Self {
        Self {
            north,
            south,
            east,
            west,
        }
    }

    pub fn get(&self, direction: Direction) -> u32 {
        match direction {
            Direction::North => self.north,
            Direction::South => self.south,
            Direction::East => self.east,
            Direction::West => self.west,
        }
    }

    pub fn add(&mut self, direction: Direction, n: u32) {
        let slot = match direction {
            Direction::North => &mut self.north,
            Direction::South => &mut self.south,
            Direction::East => &mut self.east,
            Direction::West => &mut self.west,
        };
        *slot = slot.saturating_add(n);
    }

    /// Counts in N, S, E, W order.
    pub fn as_array(&self) -> [u32; 4] {
        [self.north, self.south, self.east, self.west]
    }

    pub fn total(&self) -> u32 {
        self.as_array().iter().sum()
    }

    /// Direction with the highest count; the first direction in N, S, E, W
    /// order wins a tie.
    pub fn most_congested(&self) -> Direction {
        let mut best = Direction::North;
        for direction in Direction::ALL {
            if self.get(direction) > self.get(best) {
                best = direction;
            }
        }
        best
    }

    /// Normalize a loosely-typed sensor payload.
    ///
    /// Accepts `{"North": 3}`, `{"North": {"count": 3}}`, numeric strings and
    /// floats (truncated). Anything else (negative, bool, null, arrays,
    /// missing keys) counts as 0. Never fails.
    pub fn from_json(value: &Value) -> Self {
        let mut counts = Self::default();
        let Some(map) = value.as_object() else {
            return counts;
        };
        for direction in Direction::ALL {
            if let Some(entry) = map.get(direction.as_str()) {
                counts.add(direction, coerce_count(entry));
            }
        }
        counts
    }
}

fn coerce_count(value: &Value) -> u32 {
    match value {
        Value::Number(n) => {
            if let Some(v) = n.as_u64() {
                v.min(u32::MAX as u64) as u32
            } else if let Some(v) = n.as_f64() {
                if v.is_finite() && v > 0.0 {
                    v.trunc().min(u32::MAX as f64) as u32
                } else {
                    0
                }
            } else {
                0
            }
        }
        Value::String(s) => s.trim().parse::<u32>().unwrap_or(0),
        Value::Object(map) => map.get("count").map(coerce_count).unwrap_or(0),
        _ => 0,
    }
}

// ============================================================================
// PHASES
// ============================================================================

/// Binary signal decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhaseAction {
    /// Keep the current phase (fail-safe default).
    Hold,
    /// Advance to the next phase.
    Switch,
}

impl PhaseAction {
    /// Wire encoding: 0 = hold, 1 = switch.
    pub fn code(&self) -> u8 {
        match self {
            Self::Hold => 0,
            Self::Switch => 1,
        }
    }

    pub fn from_index(idx: usize) -> Self {
        if idx == 1 {
            Self::Switch
        } else {
            Self::Hold
        }
    }
}

/// Which approaches have right-of-way in each signal phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhasePlan {
    pub green: Vec<Vec<Direction>>,
}

impl Default for PhasePlan {
    fn default() -> Self {
        let east_west = vec![Direction::East, Direction::West];
        let north_south = vec![Direction::North, Direction::South];
        let mut green = Vec::with_capacity(8);
        for _ in 0..4 {
            green.push(east_west.clone());
        }
        for _ in 0..4 {
            green.push(north_south.clone());
        }
        Self { green }
    }
}

impl PhasePlan {
    pub fn phase_count(&self) -> u32 {
        self.green.len() as u32
    }

    pub fn is_green(&self, phase: u32, direction: Direction) -> bool {
        self.green
            .get(phase as usize)
            .map(|dirs| dirs.contains(&direction))
            .unwrap_or(false)
    }

    pub fn next_phase(&self, phase: u32) -> u32 {
        let count = self.phase_count().max(1);
        (phase + 1) % count
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub junction: JunctionConfig,
    pub control: ControlConfig,
    pub emergency: EmergencyConfig,
    pub alerts: AlertConfig,
    pub violations: ViolationConfig,
    pub simulation: SimulationConfig,
    pub models: ModelConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JunctionConfig {
    pub name: String,
    pub phases: PhasePlan,
}

impl Default for JunctionConfig {
    fn default() -> Self {
        Self {
            name: "Kochi Junction".to_string(),
            phases: PhasePlan::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub history_capacity: usize,
    pub rolling_window: usize,
    /// Multiplier applied to the forecast before it enters the policy state.
    pub forecast_scale: f64,
    pub tick_interval_ms: u64,
    pub step_timeout_ms: u64,
    pub status_cache_ttl_secs: f64,
    pub event_bus_capacity: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            history_capacity: 60,
            rolling_window: 10,
            forecast_scale: 0.3,
            tick_interval_ms: 1000,
            step_timeout_ms: 5000,
            status_cache_ttl_secs: 60.0,
            event_bus_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencyConfig {
    pub timeout_secs: f64,
    pub history_capacity: usize,
    /// Seconds after a deactivation/expiry during which simulator-detected
    /// emergency vehicles do not re-activate the override. 0 disables.
    pub auto_detect_cooldown_secs: f64,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120.0,
            history_capacity: 50,
            auto_detect_cooldown_secs: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub history_capacity: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViolationConfig {
    pub distance_threshold: f64,
    pub dwell_threshold_secs: f64,
    pub critical_dwell_secs: f64,
    pub stale_after_secs: f64,
    pub history_capacity: usize,
}

impl Default for ViolationConfig {
    fn default() -> Self {
        Self {
            distance_threshold: 15.0,
            dwell_threshold_secs: 120.0,
            critical_dwell_secs: 180.0,
            stale_after_secs: 10.0,
            history_capacity: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub scenario_path: PathBuf,
    pub max_steps: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            scenario_path: PathBuf::from("scenario.yaml"),
            max_steps: 600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// JSON weight file for the linear Q policy. `None` uses the built-in
    /// pressure weights.
    pub policy_weights: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "junction_control=info".to_string(),
        }
    }
}
