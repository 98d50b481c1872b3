// src/simulation/manager.rs
//
// Step loop over one live intersection connection.
//
// start → step* → stop. The session mutex is the connection's mutual
// exclusion; `running` mirrors it so status readers never wait on a step
// in flight. A failing step closes the connection and leaves the manager
// stopped; the caller must `start` again.

use super::intersection::{Intersection, LaneOccupant};
use crate::alerts::TrafficSnapshot;
use crate::control::{DecisionEngine, DecisionSource, TickInput, TickTime};
use crate::pipeline::metrics::ControlMetrics;
use crate::sync::lock;
use crate::types::{Direction, DirectionCounts, PhaseAction};
use anyhow::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("Simulation already running")]
    AlreadyRunning,
    #[error("Simulation not running")]
    NotRunning,
    #[error("Config not found: {}", .0.display())]
    ConfigNotFound(PathBuf),
    #[error("Simulator error: {0}")]
    Simulator(String),
    #[error("Simulation step timed out after {0} ms")]
    StepTimeout(u64),
}

/// Opens a backend from its configuration file.
pub type Connector = Box<dyn Fn(&Path) -> Result<Box<dyn Intersection>> + Send + Sync>;

// ============================================================================
// STEP METRICS
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct EmergencyVehicle {
    pub id: String,
    pub direction: Direction,
    #[serde(rename = "type")]
    pub vehicle_type: String,
    #[serde(rename = "pos")]
    pub relative_position: f64,
}

/// Vehicles per approach plus the phase after the step.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LaneView {
    #[serde(rename = "North")]
    pub north: Vec<LaneOccupant>,
    #[serde(rename = "South")]
    pub south: Vec<LaneOccupant>,
    #[serde(rename = "East")]
    pub east: Vec<LaneOccupant>,
    #[serde(rename = "West")]
    pub west: Vec<LaneOccupant>,
    pub tl_phase: u32,
}

impl LaneView {
    fn slot(&mut self, direction: Direction) -> &mut Vec<LaneOccupant> {
        match direction {
            Direction::North => &mut self.north,
            Direction::South => &mut self.south,
            Direction::East => &mut self.east,
            Direction::West => &mut self.west,
        }
    }

    pub fn get(&self, direction: Direction) -> &[LaneOccupant] {
        match direction {
            Direction::North => &self.north,
            Direction::South => &self.south,
            Direction::East => &self.east,
            Direction::West => &self.west,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepMetrics {
    pub queue_length: u32,
    pub waiting_time: f64,
    /// Sensor counts the decision was made on.
    pub vehicle_count: DirectionCounts,
    pub viz: LaneView,
    pub emergency_vehicles: Vec<EmergencyVehicle>,
    pub action: PhaseAction,
    pub source: DecisionSource,
    /// Phase the decision was taken in; `viz.tl_phase` is the phase after.
    pub decided_phase: u32,
    pub step: u64,
}

impl StepMetrics {
    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            queue_length: self.queue_length,
            waiting_time: self.waiting_time,
            vehicle_count: self.vehicle_count,
        }
    }
}

// ============================================================================
// MANAGER
// ============================================================================

struct Session {
    backend: Option<Box<dyn Intersection>>,
    step_count: u64,
}

pub struct SimulationManager {
    engine: Arc<DecisionEngine>,
    config_path: PathBuf,
    connector: Connector,
    session: Mutex<Session>,
    running: AtomicBool,
    metrics: ControlMetrics,
}

impl SimulationManager {
    pub fn new(
        engine: Arc<DecisionEngine>,
        config_path: impl Into<PathBuf>,
        connector: Connector,
        metrics: ControlMetrics,
    ) -> Self {
        Self {
            engine,
            config_path: config_path.into(),
            connector,
            session: Mutex::new(Session {
                backend: None,
                step_count: 0,
            }),
            running: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn start(&self) -> Result<&'static str, ControlError> {
        let mut session = lock(&self.session);
        if session.backend.is_some() {
            warn!("Simulation already running");
            return Err(ControlError::AlreadyRunning);
        }
        if !self.config_path.exists() {
            return Err(ControlError::ConfigNotFound(self.config_path.clone()));
        }

        let backend = (self.connector)(&self.config_path).map_err(|e| {
            error!("Failed to start simulation: {e:#}");
            ControlError::Simulator(format!("{e:#}"))
        })?;
        session.backend = Some(backend);
        session.step_count = 0;
        self.running.store(true, Ordering::SeqCst);
        info!("✓ Simulation started ({})", self.config_path.display());
        Ok("Simulation started")
    }

    /// One tick: sense, decide, actuate, advance, measure.
    pub fn step(&self, emergency: Option<Direction>) -> Result<StepMetrics, ControlError> {
        let mut guard = lock(&self.session);
        let session = &mut *guard;
        let Some(backend) = session.backend.as_mut() else {
            return Err(ControlError::NotRunning);
        };

        let started = Instant::now();
        let next_step = session.step_count + 1;
        match self.run_step(&mut **backend, emergency, next_step) {
            Ok(metrics) => {
                session.step_count = next_step;
                self.metrics.record_step(started.elapsed());
                Ok(metrics)
            }
            Err(e) => {
                error!("Error during simulation step: {e:#}");
                self.metrics.record_step_failure();
                self.shutdown(session);
                Err(ControlError::Simulator(format!("{e:#}")))
            }
        }
    }

    pub fn stop(&self) -> Result<&'static str, ControlError> {
        let mut session = lock(&self.session);
        if session.backend.is_none() {
            return Err(ControlError::NotRunning);
        }
        self.shutdown(&mut session);
        Ok("Simulation stopped")
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn step_count(&self) -> u64 {
        lock(&self.session).step_count
    }

    fn shutdown(&self, session: &mut Session) {
        if let Some(mut backend) = session.backend.take() {
            match backend.close() {
                Ok(()) => info!("Simulation stopped after {} steps", session.step_count),
                Err(e) => error!("Error closing simulation: {e:#}"),
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    fn run_step(
        &self,
        backend: &mut dyn Intersection,
        emergency: Option<Direction>,
        step: u64,
    ) -> Result<StepMetrics> {
        let counts = backend.get_counts()?;
        let sim_time = backend.sim_time()?;
        let phase = backend.get_phase()?;

        let decision = self.engine.decide(TickInput {
            counts,
            time: TickTime::Simulated(sim_time),
            current_phase: phase,
            emergency,
        });
        if decision.action == PhaseAction::Switch {
            backend.set_phase(self.engine.plan().next_phase(phase))?;
        }
        backend.advance_one_step()?;

        let lanes = backend.controlled_lanes()?;
        let (waiting_time, queue_length) = backend.aggregate_wait_and_queue(&lanes)?;

        let mut viz = LaneView::default();
        let mut emergency_vehicles = Vec::new();
        for direction in Direction::ALL {
            let occupants = backend.lane_occupants(direction)?;
            emergency_vehicles.extend(occupants.iter().filter(|v| v.is_emergency()).map(|v| {
                EmergencyVehicle {
                    id: v.id.clone(),
                    direction,
                    vehicle_type: v.vehicle_type.clone(),
                    relative_position: v.relative_position,
                }
            }));
            *viz.slot(direction) = occupants;
        }
        viz.tl_phase = backend.get_phase()?;

        self.engine
            .record_step(step, decision.action, queue_length, waiting_time);

        Ok(StepMetrics {
            queue_length,
            waiting_time,
            vehicle_count: counts,
            viz,
            emergency_vehicles,
            action: decision.action,
            source: decision.source,
            decided_phase: phase,
            step,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::control::{Forecaster, FeatureVector, ModelBundle, Policy};
    use crate::types::{ControlConfig, PhasePlan};
    use std::sync::atomic::AtomicU32;

    /// In-memory intersection: fixed counts, records phase changes, and can
    /// be told to fail on a given step.
    pub(crate) struct ScriptedIntersection {
        pub counts: DirectionCounts,
        pub phase: u32,
        pub time: f64,
        pub occupants: Vec<(Direction, LaneOccupant)>,
        pub fail_on_step: Option<u32>,
        pub steps: Arc<AtomicU32>,
        pub closed: Arc<AtomicBool>,
    }

    impl ScriptedIntersection {
        pub(crate) fn new(counts: DirectionCounts) -> Self {
            Self {
                counts,
                phase: 0,
                time: 0.0,
                occupants: Vec::new(),
                fail_on_step: None,
                steps: Arc::new(AtomicU32::new(0)),
                closed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl Intersection for ScriptedIntersection {
        fn get_counts(&self) -> Result<DirectionCounts> {
            Ok(self.counts)
        }
        fn get_phase(&self) -> Result<u32> {
            Ok(self.phase)
        }
        fn set_phase(&mut self, phase: u32) -> Result<()> {
            self.phase = phase;
            Ok(())
        }
        fn advance_one_step(&mut self) -> Result<()> {
            let n = self.steps.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on_step == Some(n) {
                anyhow::bail!("connection reset");
            }
            self.time += 1.0;
            Ok(())
        }
        fn sim_time(&self) -> Result<f64> {
            Ok(self.time)
        }
        fn controlled_lanes(&self) -> Result<Vec<String>> {
            Ok(vec!["North_0".into(), "East_0".into()])
        }
        fn lane_occupants(&self, direction: Direction) -> Result<Vec<LaneOccupant>> {
            Ok(self
                .occupants
                .iter()
                .filter(|(d, _)| *d == direction)
                .map(|(_, o)| o.clone())
                .collect())
        }
        fn aggregate_wait_and_queue(&self, lanes: &[String]) -> Result<(f64, u32)> {
            Ok((12.5 * lanes.len() as f64, self.counts.total()))
        }
        fn close(&mut self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Always(PhaseAction);

    impl Forecaster for Always {
        fn name(&self) -> &str {
            "flat"
        }
        fn forecast(&self, _: &[FeatureVector]) -> Result<[f64; 4]> {
            Ok([1.0; 4])
        }
    }

    impl Policy for Always {
        fn name(&self) -> &str {
            "always"
        }
        fn decide(&self, _: &FeatureVector, _: &[f64; 4], _: u32) -> Result<PhaseAction> {
            Ok(self.0)
        }
    }

    pub(crate) fn engine(action: PhaseAction) -> Arc<DecisionEngine> {
        let always = Arc::new(Always(action));
        Arc::new(DecisionEngine::new(
            ControlConfig::default(),
            PhasePlan::default(),
            Some(ModelBundle::new(always.clone(), always)),
            ControlMetrics::new(),
        ))
    }

    /// Manager whose connector hands out `make()` and whose config path is
    /// this crate's manifest, which always exists.
    pub(crate) fn manager_with(
        engine: Arc<DecisionEngine>,
        make: impl Fn() -> ScriptedIntersection + Send + Sync + 'static,
    ) -> SimulationManager {
        SimulationManager::new(
            engine,
            concat!(env!("CARGO_MANIFEST_DIR"), "/Cargo.toml"),
            Box::new(move |_: &Path| -> Result<Box<dyn Intersection>> { Ok(Box::new(make())) }),
            ControlMetrics::new(),
        )
    }

    #[test]
    fn test_step_before_start_is_rejected() {
        let m = manager_with(engine(PhaseAction::Hold), || {
            ScriptedIntersection::new(DirectionCounts::default())
        });
        assert_eq!(m.step(None).unwrap_err(), ControlError::NotRunning);
        assert_eq!(m.stop().unwrap_err(), ControlError::NotRunning);
        assert!(!m.is_running());
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let m = manager_with(engine(PhaseAction::Hold), || {
            ScriptedIntersection::new(DirectionCounts::default())
        });
        assert_eq!(m.start().unwrap(), "Simulation started");
        assert_eq!(m.start().unwrap_err(), ControlError::AlreadyRunning);
        assert_eq!(m.stop().unwrap(), "Simulation stopped");
        assert!(!m.is_running());
    }

    #[test]
    fn test_missing_config_is_rejected() {
        let m = SimulationManager::new(
            engine(PhaseAction::Hold),
            "/nonexistent/scenario.yaml",
            Box::new(|_: &Path| -> Result<Box<dyn Intersection>> { anyhow::bail!("must not connect") }),
            ControlMetrics::new(),
        );
        let err = m.start().unwrap_err();
        assert_eq!(err.to_string(), "Config not found: /nonexistent/scenario.yaml");
    }

    #[test]
    fn test_switch_advances_phase_and_counts_steps() {
        let m = manager_with(engine(PhaseAction::Switch), || {
            let mut s = ScriptedIntersection::new(DirectionCounts::new(3, 1, 0, 2));
            s.phase = 7;
            s
        });
        m.start().unwrap();
        let first = m.step(None).unwrap();
        assert_eq!(first.action, PhaseAction::Switch);
        assert_eq!(first.decided_phase, 7);
        assert_eq!(first.viz.tl_phase, 0);
        assert_eq!(first.step, 1);
        assert_eq!(first.queue_length, 6);
        assert_eq!(first.waiting_time, 25.0);

        // Same counts, cached decision, still switches.
        let second = m.step(None).unwrap();
        assert_eq!(second.source, DecisionSource::Cached);
        assert_eq!(second.viz.tl_phase, 1);
        assert_eq!(m.step_count(), 2);
    }

    #[test]
    fn test_emergency_vehicles_are_reported() {
        let m = manager_with(engine(PhaseAction::Hold), || {
            let mut s = ScriptedIntersection::new(DirectionCounts::new(1, 0, 0, 0));
            s.occupants = vec![
                (
                    Direction::South,
                    LaneOccupant {
                        id: "car_1".into(),
                        vehicle_type: "passenger".into(),
                        relative_position: 0.5,
                    },
                ),
                (
                    Direction::West,
                    LaneOccupant {
                        id: "amb_1".into(),
                        vehicle_type: "Ambulance".into(),
                        relative_position: 0.8,
                    },
                ),
            ];
            s
        });
        m.start().unwrap();
        let metrics = m.step(None).unwrap();
        assert_eq!(metrics.emergency_vehicles.len(), 1);
        assert_eq!(metrics.emergency_vehicles[0].direction, Direction::West);
        assert_eq!(metrics.viz.south.len(), 1);
        assert_eq!(metrics.viz.get(Direction::West)[0].id, "amb_1");
    }

    #[test]
    fn test_emergency_direction_reaches_engine() {
        // Phase 0 serves East/West; North needs a switch even though the
        // policy always holds.
        let m = manager_with(engine(PhaseAction::Hold), || {
            ScriptedIntersection::new(DirectionCounts::new(1, 1, 1, 1))
        });
        m.start().unwrap();
        let metrics = m.step(Some(Direction::North)).unwrap();
        assert_eq!(metrics.action, PhaseAction::Switch);
        assert_eq!(metrics.source, DecisionSource::Emergency);
        assert_eq!(metrics.viz.tl_phase, 1);
    }

    #[test]
    fn test_failed_step_stops_the_run() {
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        let m = manager_with(engine(PhaseAction::Hold), move || {
            let mut s = ScriptedIntersection::new(DirectionCounts::new(2, 2, 2, 2));
            s.fail_on_step = Some(2);
            s.closed = flag.clone();
            s
        });
        m.start().unwrap();
        assert!(m.step(None).is_ok());
        let err = m.step(None).unwrap_err();
        assert!(matches!(err, ControlError::Simulator(ref msg) if msg.contains("connection reset")));
        assert!(!m.is_running());
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(m.step(None).unwrap_err(), ControlError::NotRunning);

        // Explicit restart opens a fresh connection with the counter reset.
        m.start().unwrap();
        assert_eq!(m.step_count(), 0);
    }

    #[test]
    fn test_step_metrics_merge_into_engine_record() {
        let engine = engine(PhaseAction::Hold);
        let m = manager_with(engine.clone(), || {
            ScriptedIntersection::new(DirectionCounts::new(4, 0, 0, 0))
        });
        m.start().unwrap();
        m.step(None).unwrap();
        let latest = engine.latest_metrics();
        assert_eq!(latest.step, Some(1));
        assert_eq!(latest.queue_length, Some(4));
        assert_eq!(latest.waiting_time, Some(25.0));
    }
}
