// src/pipeline/control_loop.rs
//
// Background task driving the junction at a fixed cadence.
//
// Per tick:
//   1. resolve the emergency override (lazy expiry happens here)
//   2. simulator step on the blocking pool, bounded by `step_timeout_ms`
//   3. classify congestion from the step metrics
//   4. auto-activate preemption for a detected emergency vehicle
//   5. publish events
//
// Any step error ends the run. The loop never restarts the simulator on
// its own; shutdown is honoured between ticks only, so an in-flight step
// always completes or fails as a unit.

use super::event_bus::ControlEvent;
use super::status::TrafficCore;
use crate::alerts::Severity;
use crate::emergency::now_secs;
use crate::simulation::{ControlError, StepMetrics};
use crate::types::PhaseAction;
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct LoopOutcome {
    pub steps: u64,
    pub reason: String,
    #[serde(skip)]
    pub error: Option<ControlError>,
}

pub struct ControlLoop {
    core: Arc<TrafficCore>,
    interval: Duration,
    step_timeout: Duration,
    max_steps: Option<u64>,
    last_severity: Severity,
}

impl ControlLoop {
    pub fn new(core: Arc<TrafficCore>) -> Self {
        let control = &core.config.control;
        Self {
            interval: Duration::from_millis(control.tick_interval_ms.max(1)),
            step_timeout: Duration::from_millis(control.step_timeout_ms.max(1)),
            max_steps: None,
            last_severity: Severity::Normal,
            core,
        }
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = (max_steps > 0).then_some(max_steps);
        self
    }

    pub fn spawn(self) -> ControlHandle {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(self.run(rx));
        ControlHandle { shutdown, task }
    }

    /// Start the simulator if needed and tick until `max_steps`, an error,
    /// or a shutdown signal.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> LoopOutcome {
        let simulation = self.core.simulation.clone();
        match blocking(move || simulation.start()).await {
            Ok(msg) => info!("✓ {msg}"),
            Err(ControlError::AlreadyRunning) => debug!("Simulation already running, attaching"),
            Err(e) => return self.finish(0, e.to_string(), Some(e)),
        }

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut steps = 0;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.stop_simulation().await;
                        return self.finish(steps, "shutdown requested".into(), None);
                    }
                }
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(metrics) => {
                            steps = metrics.step;
                            if self.max_steps.is_some_and(|max| steps >= max) {
                                self.stop_simulation().await;
                                return self.finish(steps, format!("completed {steps} steps"), None);
                            }
                        }
                        Err(e) => {
                            error!("Control loop stopping: {e}");
                            return self.finish(steps, e.to_string(), Some(e));
                        }
                    }
                }
            }
        }
    }

    pub async fn tick(&mut self) -> Result<StepMetrics, ControlError> {
        let core = self.core.clone();
        let emergency = core.emergency.get_priority_direction();

        let simulation = core.simulation.clone();
        let step = tokio::task::spawn_blocking(move || simulation.step(emergency));
        let metrics = match time::timeout(self.step_timeout, step).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join)) => {
                self.stop_simulation().await;
                return Err(ControlError::Simulator(format!("step task failed: {join}")));
            }
            Err(_) => {
                core.metrics.record_step_failure();
                let simulation = core.simulation.clone();
                // Closes the connection once the stuck step releases it.
                tokio::task::spawn_blocking(move || simulation.stop());
                return Err(ControlError::StepTimeout(self.step_timeout.as_millis() as u64));
            }
        };

        if metrics.action == PhaseAction::Switch {
            core.publish(ControlEvent::PhaseSwitched {
                step: metrics.step,
                from: metrics.decided_phase,
                to: metrics.viz.tl_phase,
                source: metrics.source,
            });
        }

        let alert = core.alerts.evaluate(&metrics.snapshot());
        if alert.severity != Severity::Normal && alert.severity != self.last_severity {
            core.metrics.record_alert();
            core.publish(ControlEvent::AlertRaised {
                step: metrics.step,
                severity: alert.severity,
                message: alert.message.clone(),
            });
        }
        self.last_severity = alert.severity;

        if let Some(vehicle) = metrics.emergency_vehicles.first() {
            if core.emergency.accepts_auto_activation_at(now_secs()) {
                warn!(
                    "🚨 Auto-detected emergency vehicle {} ({}) on {}",
                    vehicle.id, vehicle.vehicle_type, vehicle.direction
                );
                core.emergency.activate(vehicle.direction);
                core.invalidate_status();
                core.metrics.record_auto_activation();
                core.publish(ControlEvent::EmergencyAutoActivated {
                    step: metrics.step,
                    vehicle_id: vehicle.id.clone(),
                    direction: vehicle.direction,
                });
            }
        }

        debug!(
            "Step {}: {:?} ({:?}), queue {}, wait {:.1}s",
            metrics.step, metrics.action, metrics.source, metrics.queue_length, metrics.waiting_time
        );
        Ok(metrics)
    }

    async fn stop_simulation(&self) {
        let simulation = self.core.simulation.clone();
        if !simulation.is_running() {
            return;
        }
        if let Err(e) = blocking(move || simulation.stop()).await {
            debug!("Stop after loop exit: {e}");
        }
    }

    fn finish(&self, steps: u64, reason: String, error: Option<ControlError>) -> LoopOutcome {
        info!("Control loop stopped after {steps} steps: {reason}");
        self.core.publish(ControlEvent::LoopStopped {
            steps,
            reason: reason.clone(),
        });
        self.core.invalidate_status();
        LoopOutcome {
            steps,
            reason,
            error,
        }
    }
}

/// Run a synchronous manager call on the blocking pool.
async fn blocking<F>(f: F) -> Result<&'static str, ControlError>
where
    F: FnOnce() -> Result<&'static str, ControlError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .unwrap_or_else(|e| Err(ControlError::Simulator(format!("task failed: {e}"))))
}

pub struct ControlHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<LoopOutcome>,
}

impl ControlHandle {
    /// Signal shutdown and wait for the loop to finish its current tick.
    pub async fn stop(self) -> Result<LoopOutcome> {
        // The loop may already have exited and dropped its receiver.
        let _ = self.shutdown.send(true);
        Ok(self.task.await?)
    }

    /// Wait for the loop to end on its own.
    pub async fn join(self) -> Result<LoopOutcome> {
        Ok(self.task.await?)
    }

    /// Wait for the loop to end, or stop it cleanly on Ctrl-C.
    pub async fn join_or_ctrl_c(self) -> Result<LoopOutcome> {
        let ControlHandle { shutdown, mut task } = self;
        tokio::select! {
            outcome = &mut task => return Ok(outcome?),
            _ = tokio::signal::ctrl_c() => info!("Ctrl-C received, finishing current tick"),
        }
        let _ = shutdown.send(true);
        Ok(task.await?)
    }
}
