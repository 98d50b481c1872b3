// src/control/engine.rs
//
// Per-tick phase decision.
//
// Order of evaluation:
//   1. Emergency override  -> deterministic hold/switch, models bypassed
//   2. Missing models      -> fail-safe hold, engine marked degraded
//   3. Result cache        -> reuse when counts + emergency are unchanged
//   4. Features -> history -> forecast -> policy
//
// Locking: inputs are copied and history is updated under `state`, the
// lock is released while the forecaster and policy run, then re-acquired
// to commit the result. Inference errors and panics degrade to hold.
//
// Every tick that reaches inference, and every cache invalidation, bumps
// `generation`. A result is cached only if the generation it started
// under is still current at commit.

use super::cache::InputCache;
use super::features::{build_features, FeatureVector, TickTime};
use super::history::HistoryBuffer;
use super::models::ModelBundle;
use crate::pipeline::metrics::ControlMetrics;
use crate::sync::{lock, read, write};
use crate::types::{ControlConfig, Direction, DirectionCounts, PhaseAction, PhasePlan};
use anyhow::Result;
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, RwLock};
use std::time::Instant;
use tracing::{debug, error, info, warn};

// ============================================================================
// TYPES
// ============================================================================

/// Everything the engine needs for one tick.
#[derive(Debug, Clone, Copy)]
pub struct TickInput {
    pub counts: DirectionCounts,
    pub time: TickTime,
    pub current_phase: u32,
    pub emergency: Option<Direction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// No tick has been decided yet.
    NoData,
    Emergency,
    Policy,
    Cached,
    FailSafe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    ColdStart,
    Warm,
    EmergencyOverride,
    /// Models unavailable; every non-emergency tick holds.
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub action: PhaseAction,
    pub source: DecisionSource,
    pub counts: DirectionCounts,
    pub current_phase: u32,
    pub emergency_direction: Option<Direction>,
}

impl Decision {
    fn no_data() -> Self {
        Self {
            action: PhaseAction::Hold,
            source: DecisionSource::NoData,
            counts: DirectionCounts::default(),
            current_phase: 0,
            emergency_direction: None,
        }
    }

    fn fail_safe(input: &TickInput) -> Self {
        Self {
            action: PhaseAction::Hold,
            source: DecisionSource::FailSafe,
            counts: input.counts,
            current_phase: input.current_phase,
            emergency_direction: None,
        }
    }
}

/// Exported record of the latest inference, merged with step figures by
/// the simulation loop.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DecisionMetrics {
    pub action: u8,
    pub current_phase: u32,
    pub avg_counts: DirectionMeans,
    pub forecast: [f64; 4],
    pub predicted_congestion_index: f64,
    pub step: Option<u64>,
    pub queue_length: Option<u32>,
    pub waiting_time: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DirectionMeans {
    #[serde(rename = "North")]
    pub north: f64,
    #[serde(rename = "South")]
    pub south: f64,
    #[serde(rename = "East")]
    pub east: f64,
    #[serde(rename = "West")]
    pub west: f64,
}

impl From<[f64; 4]> for DirectionMeans {
    fn from(v: [f64; 4]) -> Self {
        Self {
            north: v[0],
            south: v[1],
            east: v[2],
            west: v[3],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CacheKey {
    counts: DirectionCounts,
    emergency: Option<Direction>,
}

struct DecisionState {
    history: HistoryBuffer,
    last_counts: DirectionCounts,
    last_decision: Option<Decision>,
    cache: InputCache<CacheKey, Decision>,
    generation: u64,
    mode: EngineMode,
}

impl DecisionState {
    fn invalidate_cache(&mut self) {
        self.cache.invalidate();
        self.generation += 1;
    }
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct DecisionEngine {
    config: ControlConfig,
    plan: PhasePlan,
    models: RwLock<Option<ModelBundle>>,
    state: Mutex<DecisionState>,
    latest: Mutex<DecisionMetrics>,
    metrics: ControlMetrics,
}

impl DecisionEngine {
    /// `models = None` models a failed initialisation: the engine starts
    /// degraded and holds until `replace_models` is called.
    pub fn new(
        config: ControlConfig,
        plan: PhasePlan,
        models: Option<ModelBundle>,
        metrics: ControlMetrics,
    ) -> Self {
        let mode = if models.is_some() {
            EngineMode::ColdStart
        } else {
            warn!("Decision engine starting without models, fail-safe hold only");
            EngineMode::Degraded
        };
        Self {
            state: Mutex::new(DecisionState {
                history: HistoryBuffer::with_capacity(config.history_capacity),
                last_counts: DirectionCounts::default(),
                last_decision: None,
                cache: InputCache::new(),
                generation: 0,
                mode,
            }),
            config,
            plan,
            models: RwLock::new(models),
            latest: Mutex::new(DecisionMetrics::default()),
            metrics,
        }
    }

    pub fn plan(&self) -> &PhasePlan {
        &self.plan
    }

    pub fn decide(&self, input: TickInput) -> Decision {
        let decision = self.evaluate(input);
        self.metrics.record_decision(decision.action, decision.source);
        decision
    }

    fn evaluate(&self, input: TickInput) -> Decision {
        if let Some(direction) = input.emergency {
            return self.preempt(direction, input);
        }

        let key = CacheKey {
            counts: input.counts,
            emergency: None,
        };

        let Some(models) = read(&self.models).clone() else {
            return self.fail_safe_without_models(input);
        };

        let (features, window, generation) = {
            let mut state = lock(&self.state);

            if let Some(mut cached) = state.cache.lookup(&key) {
                debug!("Counts unchanged, reusing {:?}", cached.action);
                cached.source = DecisionSource::Cached;
                state.last_decision = Some(cached.clone());
                return cached;
            }

            let features = build_features(
                &input.counts,
                &state.last_counts,
                input.time,
                &state.history,
                self.config.rolling_window,
            );
            state.history.append(features.clone());
            state.last_counts = input.counts;

            if state.history.is_full() {
                state.mode = EngineMode::Warm;
            } else {
                state.history.pad_to_capacity(&features);
                state.mode = EngineMode::ColdStart;
                debug!(
                    "History warm-up: padded to {} entries",
                    state.history.capacity()
                );
            }

            state.generation += 1;
            (features, state.history.snapshot(), state.generation)
        };

        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.infer(&models, &window, &features, input.current_phase)
        }))
        .unwrap_or_else(|_| Err(anyhow::anyhow!("inference panicked")));
        self.metrics.record_inference(started.elapsed(), outcome.is_ok());

        let mut state = lock(&self.state);
        match outcome {
            Ok((action, forecast)) => {
                let decision = Decision {
                    action,
                    source: DecisionSource::Policy,
                    counts: input.counts,
                    current_phase: input.current_phase,
                    emergency_direction: None,
                };
                if state.generation == generation {
                    state.cache.store(key, decision.clone());
                } else {
                    debug!("State moved on during inference, result not cached");
                }
                state.last_decision = Some(decision.clone());
                drop(state);

                let congestion = forecast.iter().sum::<f64>() / forecast.len() as f64;
                *lock(&self.latest) = DecisionMetrics {
                    action: action.code(),
                    current_phase: input.current_phase,
                    avg_counts: features.means().into(),
                    forecast,
                    predicted_congestion_index: congestion,
                    step: None,
                    queue_length: None,
                    waiting_time: None,
                };
                decision
            }
            Err(e) => {
                error!("Inference error: {e:#}");
                let decision = Decision::fail_safe(&input);
                // The last inference saw different input than any cached entry.
                state.invalidate_cache();
                state.last_decision = Some(decision.clone());
                decision
            }
        }
    }

    fn fail_safe_without_models(&self, input: TickInput) -> Decision {
        warn!("Models not loaded, returning fail-safe hold");
        let decision = Decision::fail_safe(&input);
        let mut state = lock(&self.state);
        state.mode = EngineMode::Degraded;
        state.invalidate_cache();
        state.last_decision = Some(decision.clone());
        decision
    }

    fn preempt(&self, direction: Direction, input: TickInput) -> Decision {
        let action = if self.plan.is_green(input.current_phase, direction) {
            info!(
                "🚨 Emergency: {} already has green (phase {}), holding",
                direction, input.current_phase
            );
            PhaseAction::Hold
        } else {
            info!(
                "🚨 Emergency: switching to give {} green (from phase {})",
                direction, input.current_phase
            );
            PhaseAction::Switch
        };

        let decision = Decision {
            action,
            source: DecisionSource::Emergency,
            counts: input.counts,
            current_phase: input.current_phase,
            emergency_direction: Some(direction),
        };

        let mut state = lock(&self.state);
        state.mode = EngineMode::EmergencyOverride;
        // The next non-emergency tick differs from this one in its emergency
        // input, so nothing cached before the override may be reused.
        state.invalidate_cache();
        state.last_decision = Some(decision.clone());
        decision
    }

    fn infer(
        &self,
        models: &ModelBundle,
        window: &[FeatureVector],
        features: &FeatureVector,
        current_phase: u32,
    ) -> Result<(PhaseAction, [f64; 4])> {
        let forecast = models.forecaster.forecast(window)?;
        if forecast.iter().any(|v| !v.is_finite()) {
            anyhow::bail!("forecaster {} produced {forecast:?}", models.forecaster.name());
        }
        let scaled = forecast.map(|v| v * self.config.forecast_scale);
        let action = models.policy.decide(features, &scaled, current_phase)?;
        Ok((action, forecast))
    }

    // ========================================================================
    // MODEL LIFECYCLE & QUERIES
    // ========================================================================

    /// Install new models and leave degraded mode.
    pub fn replace_models(&self, models: ModelBundle) {
        info!("Replacing decision models: {models:?}");
        *write(&self.models) = Some(models);
        let mut state = lock(&self.state);
        state.invalidate_cache();
        if state.mode == EngineMode::Degraded {
            state.mode = if state.history.is_full() {
                EngineMode::Warm
            } else {
                EngineMode::ColdStart
            };
        }
    }

    pub fn is_operational(&self) -> bool {
        read(&self.models).is_some()
    }

    pub fn mode(&self) -> EngineMode {
        lock(&self.state).mode
    }

    /// Latest decision; a "no data" hold before the first tick.
    pub fn last_decision(&self) -> Decision {
        lock(&self.state)
            .last_decision
            .clone()
            .unwrap_or_else(Decision::no_data)
    }

    pub fn latest_metrics(&self) -> DecisionMetrics {
        lock(&self.latest).clone()
    }

    /// Fold simulator step figures into the exported record.
    pub fn record_step(&self, step: u64, action: PhaseAction, queue_length: u32, waiting_time: f64) {
        let mut latest = lock(&self.latest);
        latest.step = Some(step);
        latest.action = action.code();
        latest.queue_length = Some(queue_length);
        latest.waiting_time = Some(waiting_time);
    }

    pub fn history_len(&self) -> usize {
        lock(&self.state).history.len()
    }

    pub fn history_snapshot(&self) -> Vec<FeatureVector> {
        lock(&self.state).history.snapshot()
    }
}
