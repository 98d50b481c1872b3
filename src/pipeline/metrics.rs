// src/pipeline/metrics.rs
//
// Control-loop observability. Counters are shared by the decision engine,
// the step loop and the control loop; readers take a summary without
// blocking any of them.

use crate::control::DecisionSource;
use crate::types::PhaseAction;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Counters {
    ticks: AtomicU64,
    switches: AtomicU64,
    holds: AtomicU64,
    emergency_overrides: AtomicU64,
    emergency_auto_activations: AtomicU64,
    cache_hits: AtomicU64,
    inferences: AtomicU64,
    inference_failures: AtomicU64,
    alerts_raised: AtomicU64,
    violations_flagged: AtomicU64,
    steps: AtomicU64,
    step_failures: AtomicU64,
    last_step_us: AtomicU64,
    last_inference_us: AtomicU64,
}

/// Cheap to clone; every clone feeds the same counters.
#[derive(Debug, Clone)]
pub struct ControlMetrics {
    counters: Arc<Counters>,
    started_at: Instant,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn micros(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}

impl ControlMetrics {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            started_at: Instant::now(),
        }
    }

    /// One engine tick, whatever path produced it.
    pub fn record_decision(&self, action: PhaseAction, source: DecisionSource) {
        let c = &self.counters;
        bump(&c.ticks);
        match action {
            PhaseAction::Switch => bump(&c.switches),
            PhaseAction::Hold => bump(&c.holds),
        }
        match source {
            DecisionSource::Cached => bump(&c.cache_hits),
            DecisionSource::Emergency => bump(&c.emergency_overrides),
            DecisionSource::NoData | DecisionSource::Policy | DecisionSource::FailSafe => {}
        }
    }

    /// One forecast + policy run. Failures include panics and non-finite output.
    pub fn record_inference(&self, elapsed: Duration, succeeded: bool) {
        let c = &self.counters;
        bump(&c.inferences);
        if !succeeded {
            bump(&c.inference_failures);
        }
        c.last_inference_us.store(micros(elapsed), Ordering::Relaxed);
    }

    pub fn record_step(&self, elapsed: Duration) {
        bump(&self.counters.steps);
        self.counters
            .last_step_us
            .store(micros(elapsed), Ordering::Relaxed);
    }

    /// A simulator error or a step that overran its timeout.
    pub fn record_step_failure(&self) {
        bump(&self.counters.step_failures);
    }

    pub fn record_alert(&self) {
        bump(&self.counters.alerts_raised);
    }

    pub fn record_auto_activation(&self) {
        bump(&self.counters.emergency_auto_activations);
    }

    pub fn record_violations(&self, flagged: usize) {
        self.counters
            .violations_flagged
            .fetch_add(flagged as u64, Ordering::Relaxed);
    }

    pub fn ticks_per_sec(&self) -> f64 {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            self.counters.ticks.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let c = &self.counters;
        MetricsSummary {
            ticks: load(&c.ticks),
            ticks_per_sec: self.ticks_per_sec(),
            switches: load(&c.switches),
            holds: load(&c.holds),
            emergency_overrides: load(&c.emergency_overrides),
            emergency_auto_activations: load(&c.emergency_auto_activations),
            cache_hits: load(&c.cache_hits),
            inferences: load(&c.inferences),
            inference_failures: load(&c.inference_failures),
            alerts_raised: load(&c.alerts_raised),
            violations_flagged: load(&c.violations_flagged),
            steps: load(&c.steps),
            step_failures: load(&c.step_failures),
            last_step_us: load(&c.last_step_us),
            last_inference_us: load(&c.last_inference_us),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

impl Default for ControlMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub ticks: u64,
    pub ticks_per_sec: f64,
    pub switches: u64,
    pub holds: u64,
    pub emergency_overrides: u64,
    pub emergency_auto_activations: u64,
    pub cache_hits: u64,
    pub inferences: u64,
    pub inference_failures: u64,
    pub alerts_raised: u64,
    pub violations_flagged: u64,
    pub steps: u64,
    pub step_failures: u64,
    pub last_step_us: u64,
    pub last_inference_us: u64,
    pub elapsed_secs: f64,
}
