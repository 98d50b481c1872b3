// src/pipeline/status.rs
//
// Shared handles to every component plus the aggregate status view.
//
// Each component keeps its own lock; `TrafficCore` only wires them
// together. The status report is rebuilt at most once per TTL unless an
// operator action invalidates it.

use super::event_bus::{ControlEvent, EventBus};
use super::metrics::{ControlMetrics, MetricsSummary};
use crate::alerts::{AlertEngine, AlertRecord};
use crate::control::{
    Decision, DecisionEngine, DecisionMetrics, EngineMode, ModelBundle, TickInput, TickTime,
    TtlCache,
};
use crate::emergency::{now_secs, EmergencyManager, EmergencySnapshot};
use crate::simulation::{Connector, Intersection, QueueIntersection, SimulationManager};
use crate::sync::lock;
use crate::types::{Config, Direction, DirectionCounts};
use crate::violations::{Detection, Violation, ViolationTracker};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::error;

const STATUS_VIOLATIONS: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub junction: String,
    pub alert: AlertRecord,
    pub emergency: EmergencySnapshot,
    pub recent_violations: Vec<Violation>,
    pub decision: DecisionMetrics,
    pub last_decision: Decision,
    pub engine_mode: EngineMode,
    pub models_operational: bool,
    pub simulation_running: bool,
    pub metrics: MetricsSummary,
}

pub struct TrafficCore {
    pub config: Config,
    pub engine: Arc<DecisionEngine>,
    pub emergency: Arc<EmergencyManager>,
    pub alerts: Arc<AlertEngine>,
    pub violations: Arc<ViolationTracker>,
    pub simulation: Arc<SimulationManager>,
    pub events: Arc<Mutex<EventBus>>,
    pub metrics: ControlMetrics,
    status: Mutex<TtlCache<StatusReport>>,
}

impl TrafficCore {
    pub fn new(config: Config, models: Option<ModelBundle>, connector: Connector) -> Self {
        let metrics = ControlMetrics::new();
        let engine = Arc::new(DecisionEngine::new(
            config.control.clone(),
            config.junction.phases.clone(),
            models,
            metrics.clone(),
        ));
        let simulation = Arc::new(SimulationManager::new(
            engine.clone(),
            config.simulation.scenario_path.clone(),
            connector,
            metrics.clone(),
        ));
        Self {
            emergency: Arc::new(EmergencyManager::new(config.emergency.clone())),
            alerts: Arc::new(AlertEngine::new(config.junction.name.clone(), &config.alerts)),
            violations: Arc::new(ViolationTracker::new(config.violations.clone())),
            events: Arc::new(Mutex::new(EventBus::new(config.control.event_bus_capacity))),
            status: Mutex::new(TtlCache::new(config.control.status_cache_ttl_secs)),
            engine,
            simulation,
            metrics,
            config,
        }
    }

    /// Configured models and the in-process queue model backend. A model
    /// load failure leaves the engine degraded rather than failing startup.
    pub fn from_config(config: Config) -> Self {
        let models = match ModelBundle::load(&config.models, &config.junction.phases) {
            Ok(models) => Some(models),
            Err(e) => {
                error!("Model load failed, running fail-safe: {e:#}");
                None
            }
        };
        let plan = config.junction.phases.clone();
        let connector: Connector = Box::new(move |path: &Path| -> Result<Box<dyn Intersection>> {
            Ok(Box::new(QueueIntersection::open(path, plan.clone())?))
        });
        Self::new(config, models, connector)
    }

    /// Operator override. `direction` must name a cardinal approach.
    pub fn activate_emergency(&self, direction: &str) -> Result<EmergencySnapshot> {
        let direction: Direction = direction.parse()?;
        self.emergency.activate(direction);
        self.invalidate_status();
        Ok(self.emergency.get_state())
    }

    pub fn deactivate_emergency(&self) -> EmergencySnapshot {
        self.emergency.deactivate();
        self.invalidate_status();
        self.emergency.get_state()
    }

    /// Camera path: feed detections to the parking tracker.
    pub fn report_detections(&self, camera: &str, detections: &[Detection]) -> Vec<Violation> {
        let flagged = self.violations.update(camera, detections);
        if !flagged.is_empty() {
            self.metrics.record_violations(flagged.len());
            let mut events = lock(&self.events);
            for v in &flagged {
                events.publish(ControlEvent::ViolationFlagged(v.clone()));
            }
        }
        flagged
    }

    /// Sensor path: decide on a loosely-typed count payload at wall-clock
    /// time, honouring any active emergency override.
    pub fn decide_from_sensors(&self, payload: &Value, current_phase: u32) -> Decision {
        let counts = DirectionCounts::from_json(payload);
        self.engine.decide(TickInput {
            counts,
            time: TickTime::now(),
            current_phase,
            emergency: self.emergency.get_priority_direction(),
        })
    }

    pub fn status_report(&self) -> StatusReport {
        self.status_report_at(now_secs())
    }

    pub fn status_report_at(&self, now: f64) -> StatusReport {
        let mut cache = lock(&self.status);
        if let Some(report) = cache.get(now) {
            return report;
        }
        let report = self.build_status();
        cache.put(report.clone(), now);
        report
    }

    pub fn invalidate_status(&self) {
        lock(&self.status).invalidate();
    }

    pub fn drain_events(&self) -> Vec<ControlEvent> {
        lock(&self.events).drain()
    }

    pub(crate) fn publish(&self, event: ControlEvent) {
        lock(&self.events).publish(event);
    }

    fn build_status(&self) -> StatusReport {
        StatusReport {
            generated_at: Utc::now(),
            junction: self.config.junction.name.clone(),
            alert: self.alerts.get_current(),
            emergency: self.emergency.get_state(),
            recent_violations: self.violations.get_violations(STATUS_VIOLATIONS),
            decision: self.engine.latest_metrics(),
            last_decision: self.engine.last_decision(),
            engine_mode: self.engine.mode(),
            models_operational: self.engine.is_operational(),
            simulation_running: self.simulation.is_running(),
            metrics: self.metrics.summary(),
        }
    }
}
