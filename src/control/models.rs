// src/control/models.rs
//
// Pluggable scoring stages. Anything that maps a feature window to a
// per-direction demand forecast is a Forecaster; anything that maps
// (features, scaled forecast, phase) to hold/switch is a Policy. The
// engine treats any Err or non-finite output as a failed inference.

use super::features::{FeatureVector, FEATURE_COUNT};
use crate::types::{Direction, ModelConfig, PhaseAction, PhasePlan};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// 15 features + 4 scaled forecasts + current phase.
pub const POLICY_STATE_SIZE: usize = FEATURE_COUNT + 4 + 1;

pub trait Forecaster: Send + Sync {
    fn name(&self) -> &str;

    /// Predict near-term demand per direction (N, S, E, W) from the window,
    /// oldest first.
    fn forecast(&self, window: &[FeatureVector]) -> Result<[f64; 4]>;
}

pub trait Policy: Send + Sync {
    fn name(&self) -> &str;

    fn decide(
        &self,
        features: &FeatureVector,
        scaled_forecast: &[f64; 4],
        current_phase: u32,
    ) -> Result<PhaseAction>;
}

/// The pair of stages the decision engine runs on every uncached tick.
#[derive(Clone)]
pub struct ModelBundle {
    pub forecaster: Arc<dyn Forecaster>,
    pub policy: Arc<dyn Policy>,
}

impl ModelBundle {
    pub fn new(forecaster: Arc<dyn Forecaster>, policy: Arc<dyn Policy>) -> Self {
        Self { forecaster, policy }
    }

    /// Build the configured stages. Without a weight file the pressure rule
    /// table stands in for the learned policy.
    pub fn load(config: &ModelConfig, plan: &PhasePlan) -> Result<Self> {
        let forecaster: Arc<dyn Forecaster> = Arc::new(TrendForecaster::default());
        let policy: Arc<dyn Policy> = match &config.policy_weights {
            Some(path) => Arc::new(LinearQPolicy::from_file(path)?),
            None => Arc::new(PressurePolicy::new(plan.clone())),
        };
        info!(
            "✓ Models ready: forecaster={}, policy={}",
            forecaster.name(),
            policy.name()
        );
        Ok(Self { forecaster, policy })
    }
}

impl std::fmt::Debug for ModelBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelBundle")
            .field("forecaster", &self.forecaster.name())
            .field("policy", &self.policy.name())
            .finish()
    }
}

// ============================================================================
// FORECASTER
// ============================================================================

/// Linear trend extrapolation over the most recent ticks.
#[derive(Debug, Clone)]
pub struct TrendForecaster {
    /// Ticks considered for the level and slope.
    pub lookback: usize,
    /// How many ticks ahead to extrapolate.
    pub horizon: f64,
}

impl Default for TrendForecaster {
    fn default() -> Self {
        Self {
            lookback: 10,
            horizon: 5.0,
        }
    }
}

impl Forecaster for TrendForecaster {
    fn name(&self) -> &str {
        "trend"
    }

    fn forecast(&self, window: &[FeatureVector]) -> Result<[f64; 4]> {
        if window.is_empty() {
            anyhow::bail!("empty feature window");
        }
        let n = self.lookback.max(1).min(window.len());
        let recent = &window[window.len() - n..];

        let mut out = [0.0; 4];
        for (i, slot) in out.iter_mut().enumerate() {
            let level = recent.iter().map(|v| v.counts()[i]).sum::<f64>() / n as f64;
            let slope = recent.iter().map(|v| v.deltas()[i]).sum::<f64>() / n as f64;
            *slot = (level + slope * self.horizon).max(0.0);
        }
        Ok(out)
    }
}

// ============================================================================
// POLICIES
// ============================================================================

/// Rule table: switch when demand on red approaches beats demand on green
/// approaches by more than `margin` vehicles.
#[derive(Debug, Clone)]
pub struct PressurePolicy {
    plan: PhasePlan,
    pub margin: f64,
}

impl PressurePolicy {
    pub fn new(plan: PhasePlan) -> Self {
        Self { plan, margin: 2.0 }
    }
}

impl Policy for PressurePolicy {
    fn name(&self) -> &str {
        "pressure"
    }

    fn decide(
        &self,
        features: &FeatureVector,
        scaled_forecast: &[f64; 4],
        current_phase: u32,
    ) -> Result<PhaseAction> {
        let counts = features.counts();
        let mut green = 0.0;
        let mut red = 0.0;
        for direction in Direction::ALL {
            let demand = counts[direction.index()] + scaled_forecast[direction.index()];
            if self.plan.is_green(current_phase, direction) {
                green += demand;
            } else {
                red += demand;
            }
        }
        if !green.is_finite() || !red.is_finite() {
            anyhow::bail!("non-finite demand (green={green}, red={red})");
        }
        Ok(if red > green + self.margin {
            PhaseAction::Switch
        } else {
            PhaseAction::Hold
        })
    }
}

/// Linear action-value function: q[a] = w[a] · state + b[a], argmax wins
/// (hold on ties).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearQPolicy {
    pub weights: [[f64; POLICY_STATE_SIZE]; 2],
    pub bias: [f64; 2],
}

impl LinearQPolicy {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read policy weights {}", path.display()))?;
        let policy: LinearQPolicy = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid policy weights in {}", path.display()))?;
        if policy
            .weights
            .iter()
            .flatten()
            .chain(policy.bias.iter())
            .any(|w| !w.is_finite())
        {
            anyhow::bail!("policy weights in {} contain non-finite values", path.display());
        }
        Ok(policy)
    }

    pub fn q_values(&self, state: &[f64; POLICY_STATE_SIZE]) -> [f64; 2] {
        let mut q = self.bias;
        for (a, row) in self.weights.iter().enumerate() {
            q[a] += row.iter().zip(state.iter()).map(|(w, s)| w * s).sum::<f64>();
        }
        q
    }
}

impl Policy for LinearQPolicy {
    fn name(&self) -> &str {
        "linear-q"
    }

    fn decide(
        &self,
        features: &FeatureVector,
        scaled_forecast: &[f64; 4],
        current_phase: u32,
    ) -> Result<PhaseAction> {
        let state = policy_state(features, scaled_forecast, current_phase);
        let q = self.q_values(&state);
        if q.iter().any(|v| !v.is_finite()) {
            anyhow::bail!("non-finite action values {q:?}");
        }
        Ok(if q[1] > q[0] {
            PhaseAction::Switch
        } else {
            PhaseAction::Hold
        })
    }
}

/// Policy input vector: features, scaled forecast, then phase.
pub fn policy_state(
    features: &FeatureVector,
    scaled_forecast: &[f64; 4],
    current_phase: u32,
) -> [f64; POLICY_STATE_SIZE] {
    let mut state = [0.0; POLICY_STATE_SIZE];
    state[..FEATURE_COUNT].copy_from_slice(features.fields());
    state[FEATURE_COUNT..FEATURE_COUNT + 4].copy_from_slice(scaled_forecast);
    state[POLICY_STATE_SIZE - 1] = current_phase as f64;
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::features::DELTAS_OFFSET;

    fn fv(counts: [f64; 4], deltas: [f64; 4]) -> FeatureVector {
        let mut fields = [0.0; FEATURE_COUNT];
        fields[..4].copy_from_slice(&counts);
        fields[DELTAS_OFFSET..DELTAS_OFFSET + 4].copy_from_slice(&deltas);
        FeatureVector::from_fields(fields)
    }

    #[test]
    fn test_trend_forecaster_extrapolates() {
        let window: Vec<FeatureVector> = (0..10)
            .map(|i| fv([i as f64, 4.0, 0.0, 0.0], [1.0, 0.0, 0.0, -1.0]))
            .collect();
        let out = TrendForecaster::default().forecast(&window).unwrap();
        assert!((out[0] - (4.5 + 5.0)).abs() < 1e-9);
        assert_eq!(out[1], 4.0);
        // Negative trend clamps at zero.
        assert_eq!(out[3], 0.0);
    }

    #[test]
    fn test_trend_forecaster_rejects_empty_window() {
        assert!(TrendForecaster::default().forecast(&[]).is_err());
    }

    #[test]
    fn test_pressure_policy_switches_toward_queue() {
        let policy = PressurePolicy::new(PhasePlan::default());
        let north_heavy = fv([12.0, 3.0, 1.0, 0.0], [0.0; 4]);
        // Phase 0 is East/West green; North/South demand dominates.
        assert_eq!(
            policy.decide(&north_heavy, &[0.0; 4], 0).unwrap(),
            PhaseAction::Switch
        );
        // Phase 4 already serves North/South.
        assert_eq!(
            policy.decide(&north_heavy, &[0.0; 4], 4).unwrap(),
            PhaseAction::Hold
        );
    }

    #[test]
    fn test_linear_q_policy_argmax() {
        let mut weights = [[0.0; POLICY_STATE_SIZE]; 2];
        // Switch value grows with the North count.
        weights[1][0] = 1.0;
        let policy = LinearQPolicy {
            weights,
            bias: [5.0, 0.0],
        };
        let low = fv([3.0, 0.0, 0.0, 0.0], [0.0; 4]);
        let high = fv([9.0, 0.0, 0.0, 0.0], [0.0; 4]);
        assert_eq!(policy.decide(&low, &[0.0; 4], 0).unwrap(), PhaseAction::Hold);
        assert_eq!(policy.decide(&high, &[0.0; 4], 0).unwrap(), PhaseAction::Switch);
        // Tie resolves to hold.
        let tie = fv([5.0, 0.0, 0.0, 0.0], [0.0; 4]);
        assert_eq!(policy.decide(&tie, &[0.0; 4], 0).unwrap(), PhaseAction::Hold);
    }

    #[test]
    fn test_linear_q_policy_non_finite_is_error() {
        let policy = LinearQPolicy {
            weights: [[0.0; POLICY_STATE_SIZE]; 2],
            bias: [0.0, 0.0],
        };
        let bad = fv([f64::NAN, 0.0, 0.0, 0.0], [0.0; 4]);
        let mut weights = policy.weights;
        weights[0][0] = 1.0;
        let policy = LinearQPolicy { weights, ..policy };
        assert!(policy.decide(&bad, &[0.0; 4], 0).is_err());
    }

    #[test]
    fn test_policy_state_layout() {
        let features = fv([1.0, 2.0, 3.0, 4.0], [0.0; 4]);
        let state = policy_state(&features, &[0.5, 0.6, 0.7, 0.8], 6);
        assert_eq!(state[0], 1.0);
        assert_eq!(state[FEATURE_COUNT], 0.5);
        assert_eq!(state[FEATURE_COUNT + 3], 0.8);
        assert_eq!(state[POLICY_STATE_SIZE - 1], 6.0);
    }

    #[test]
    fn test_bundle_load_missing_weights_fails() {
        let config = ModelConfig {
            policy_weights: Some("/nonexistent/weights.json".into()),
        };
        assert!(ModelBundle::load(&config, &PhasePlan::default()).is_err());
        assert!(ModelBundle::load(&ModelConfig::default(), &PhasePlan::default()).is_ok());
    }
}
