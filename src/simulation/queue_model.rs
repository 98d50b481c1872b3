// src/simulation/queue_model.rs
//
// In-process stand-in for a traffic simulator.
//
// Each approach has `lanes_per_approach` FIFO lanes. Every step:
//   1. vehicles already queued accrue `step_length_secs` of waiting
//   2. green approaches discharge up to `discharge_per_lane` per lane
//   3. Poisson arrivals (rate × step length) join the shortest lane,
//      plus any scripted emergency vehicles due this step
//
// Sensor counts are the vehicles currently on each approach. A vehicle is
// halted once it has waited at least one step. Seeded with ChaCha8 so runs
// are reproducible.

use super::intersection::{Intersection, LaneOccupant};
use crate::types::{Direction, DirectionCounts, PhasePlan};
use anyhow::{Context, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use tracing::{debug, info};

// ============================================================================
// SCENARIO
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub seed: u64,
    pub step_length_secs: f64,
    /// Mean arrivals per second on each approach.
    pub arrival_rates: HashMap<Direction, f64>,
    pub lanes_per_approach: usize,
    pub discharge_per_lane: u32,
    pub lane_length: f64,
    pub vehicle_spacing: f64,
    pub initial_phase: u32,
    pub emergency_arrivals: Vec<ScriptedArrival>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedArrival {
    /// Step (1-based) after which the vehicle is on the approach.
    pub step: u64,
    pub direction: Direction,
    #[serde(default = "default_emergency_type")]
    pub vehicle_type: String,
}

fn default_emergency_type() -> String {
    "emergency".to_string()
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            seed: 42,
            step_length_secs: 1.0,
            arrival_rates: Direction::ALL.into_iter().map(|d| (d, 0.2)).collect(),
            lanes_per_approach: 2,
            discharge_per_lane: 1,
            lane_length: 200.0,
            vehicle_spacing: 7.5,
            initial_phase: 0,
            emergency_arrivals: Vec::new(),
        }
    }
}

impl Scenario {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario: {}", path.display()))?;
        let scenario: Scenario = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse scenario: {}", path.display()))?;
        if scenario.lanes_per_approach == 0 {
            anyhow::bail!("lanes_per_approach must be at least 1");
        }
        if scenario.step_length_secs <= 0.0 {
            anyhow::bail!("step_length_secs must be positive");
        }
        Ok(scenario)
    }
}

// ============================================================================
// MODEL
// ============================================================================

#[derive(Debug, Clone)]
struct Vehicle {
    id: String,
    vehicle_type: String,
    waiting: f64,
}

pub struct QueueIntersection {
    scenario: Scenario,
    plan: PhasePlan,
    rng: ChaCha8Rng,
    /// Indexed by `Direction::index()`, then lane.
    lanes: [Vec<VecDeque<Vehicle>>; 4],
    phase: u32,
    step: u64,
    time: f64,
    next_vehicle: u64,
    closed: bool,
}

impl QueueIntersection {
    pub fn new(scenario: Scenario, plan: PhasePlan) -> Self {
        let lane_count = scenario.lanes_per_approach.max(1);
        let empty = || vec![VecDeque::new(); lane_count];
        info!(
            "Queue model: seed {}, {} lanes/approach, {} phases",
            scenario.seed,
            lane_count,
            plan.phase_count()
        );
        Self {
            rng: ChaCha8Rng::seed_from_u64(scenario.seed),
            phase: scenario.initial_phase % plan.phase_count().max(1),
            lanes: [empty(), empty(), empty(), empty()],
            scenario,
            plan,
            step: 0,
            time: 0.0,
            next_vehicle: 0,
            closed: false,
        }
    }

    pub fn open(path: &Path, plan: PhasePlan) -> Result<Self> {
        Ok(Self::new(Scenario::load(path)?, plan))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            anyhow::bail!("queue model connection closed");
        }
        Ok(())
    }

    fn lane_id(direction: Direction, lane: usize) -> String {
        format!("{}_{}", direction, lane)
    }

    fn parse_lane(&self, id: &str) -> Result<(Direction, usize)> {
        let (dir, idx) = id
            .rsplit_once('_')
            .with_context(|| format!("unknown lane {id:?}"))?;
        let direction: Direction = dir.parse()?;
        let lane: usize = idx.parse().with_context(|| format!("unknown lane {id:?}"))?;
        if lane >= self.lanes[direction.index()].len() {
            anyhow::bail!("unknown lane {id:?}");
        }
        Ok((direction, lane))
    }

    fn enqueue(&mut self, direction: Direction, vehicle_type: &str) {
        self.next_vehicle += 1;
        let vehicle = Vehicle {
            id: format!("{}_{}", vehicle_type, self.next_vehicle),
            vehicle_type: vehicle_type.to_string(),
            waiting: 0.0,
        };
        let lanes = &mut self.lanes[direction.index()];
        if let Some(shortest) = lanes.iter_mut().min_by_key(|l| l.len()) {
            shortest.push_back(vehicle);
        }
    }
}

impl Intersection for QueueIntersection {
    fn get_counts(&self) -> Result<DirectionCounts> {
        self.ensure_open()?;
        let mut counts = DirectionCounts::default();
        for direction in Direction::ALL {
            let n: usize = self.lanes[direction.index()].iter().map(VecDeque::len).sum();
            counts.add(direction, n as u32);
        }
        Ok(counts)
    }

    fn get_phase(&self) -> Result<u32> {
        self.ensure_open()?;
        Ok(self.phase)
    }

    fn set_phase(&mut self, phase: u32) -> Result<()> {
        self.ensure_open()?;
        if phase >= self.plan.phase_count() {
            anyhow::bail!("phase {phase} out of range (0..{})", self.plan.phase_count());
        }
        self.phase = phase;
        Ok(())
    }

    fn advance_one_step(&mut self) -> Result<()> {
        self.ensure_open()?;
        let dt = self.scenario.step_length_secs;
        self.step += 1;
        self.time += dt;

        for lane in self.lanes.iter_mut().flatten() {
            for vehicle in lane.iter_mut() {
                vehicle.waiting += dt;
            }
        }

        for direction in Direction::ALL {
            if !self.plan.is_green(self.phase, direction) {
                continue;
            }
            for lane in self.lanes[direction.index()].iter_mut() {
                for _ in 0..self.scenario.discharge_per_lane {
                    if lane.pop_front().is_none() {
                        break;
                    }
                }
            }
        }

        for direction in Direction::ALL {
            let rate = self.scenario.arrival_rates.get(&direction).copied().unwrap_or(0.0);
            let arrivals = poisson_sample(&mut self.rng, rate * dt);
            for _ in 0..arrivals {
                self.enqueue(direction, "passenger");
            }
        }

        let due: Vec<_> = self
            .scenario
            .emergency_arrivals
            .iter()
            .filter(|a| a.step == self.step)
            .map(|a| (a.direction, a.vehicle_type.clone()))
            .collect();
        for (direction, vehicle_type) in due {
            debug!("Scripted {} arriving on {} at step {}", vehicle_type, direction, self.step);
            self.enqueue(direction, &vehicle_type);
        }
        Ok(())
    }

    fn sim_time(&self) -> Result<f64> {
        self.ensure_open()?;
        Ok(self.time)
    }

    fn controlled_lanes(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        Ok(Direction::ALL
            .into_iter()
            .flat_map(|d| (0..self.lanes[d.index()].len()).map(move |i| Self::lane_id(d, i)))
            .collect())
    }

    fn lane_occupants(&self, direction: Direction) -> Result<Vec<LaneOccupant>> {
        self.ensure_open()?;
        let spacing = self.scenario.vehicle_spacing;
        let length = self.scenario.lane_length.max(1.0);
        Ok(self.lanes[direction.index()]
            .iter()
            .flat_map(|lane| {
                lane.iter().enumerate().map(move |(i, v)| LaneOccupant {
                    id: v.id.clone(),
                    vehicle_type: v.vehicle_type.clone(),
                    relative_position: (i as f64 * spacing / length).min(1.0),
                })
            })
            .collect())
    }

    fn aggregate_wait_and_queue(&self, lanes: &[String]) -> Result<(f64, u32)> {
        self.ensure_open()?;
        let mut wait = 0.0;
        let mut queue = 0u32;
        for id in lanes {
            let (direction, lane) = self.parse_lane(id)?;
            for vehicle in &self.lanes[direction.index()][lane] {
                wait += vehicle.waiting;
                if vehicle.waiting > 0.0 {
                    queue += 1;
                }
            }
        }
        Ok((wait, queue))
    }

    fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.closed = true;
        Ok(())
    }
}

/// Knuth's method below λ = 30, normal approximation above.
fn poisson_sample(rng: &mut ChaCha8Rng, lambda: f64) -> u32 {
    if lambda <= 0.0 {
        return 0;
    }
    if lambda < 30.0 {
        let l = (-lambda).exp();
        let mut k: u32 = 0;
        let mut p: f64 = 1.0;
        loop {
            k += 1;
            p *= rng.gen::<f64>();
            if p <= l {
                return k - 1;
            }
        }
    } else {
        let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
        let u2: f64 = rng.gen();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        (lambda + lambda.sqrt() * z).round().max(0.0) as u32
    }
}
