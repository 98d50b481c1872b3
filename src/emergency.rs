// src/emergency.rs
//
// Emergency-vehicle preemption.
//
// Two states, Idle and Active { direction, activated_at }. There is no
// timer: every accessor first applies `resolve(state, now)` under the same
// lock as the mutations, so an expired override flips to Idle (and logs
// one "expired" audit event) on the first read after the timeout.

use crate::sync::lock;
use crate::types::{Direction, EmergencyConfig};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PreemptionState {
    Idle,
    Active {
        direction: Direction,
        /// Seconds since the Unix epoch.
        activated_at: f64,
    },
}

/// Lazy expiry: Active past its timeout becomes Idle. Returns the new state
/// and whether an expiry happened.
pub fn resolve(state: PreemptionState, now: f64, timeout_secs: f64) -> (PreemptionState, bool) {
    match state {
        PreemptionState::Active { activated_at, .. } if now - activated_at > timeout_secs => {
            (PreemptionState::Idle, true)
        }
        other => (other, false),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyEventKind {
    EmergencyActivated,
    EmergencyDeactivated,
    EmergencyExpired,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmergencyEvent {
    pub event: EmergencyEventKind,
    pub direction: Option<Direction>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmergencySnapshot {
    pub active: bool,
    pub direction: Option<Direction>,
    pub activated_at: Option<DateTime<Utc>>,
    pub remaining_seconds: f64,
}

struct Inner {
    state: PreemptionState,
    history: VecDeque<EmergencyEvent>,
    /// When the override last went Idle, for the auto-detect cooldown.
    last_cleared_at: Option<f64>,
}

pub struct EmergencyManager {
    config: EmergencyConfig,
    inner: Mutex<Inner>,
}

impl EmergencyManager {
    pub fn new(config: EmergencyConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: PreemptionState::Idle,
                history: VecDeque::with_capacity(config.history_capacity),
                last_cleared_at: None,
            }),
            config,
        }
    }

    /// Callers validate `direction`; see `Direction::from_str`.
    pub fn activate(&self, direction: Direction) {
        self.activate_at(direction, now_secs());
    }

    pub fn activate_at(&self, direction: Direction, now: f64) {
        let mut inner = lock(&self.inner);
        inner.state = PreemptionState::Active {
            direction,
            activated_at: now,
        };
        self.record(&mut inner, EmergencyEventKind::EmergencyActivated, Some(direction), now);
        warn!("🚨 EMERGENCY ACTIVATED: Priority for {} approach", direction);
    }

    pub fn deactivate(&self) {
        self.deactivate_at(now_secs());
    }

    pub fn deactivate_at(&self, now: f64) {
        let mut inner = lock(&self.inner);
        if let PreemptionState::Active { direction, .. } = inner.state {
            self.record(
                &mut inner,
                EmergencyEventKind::EmergencyDeactivated,
                Some(direction),
                now,
            );
            info!("Emergency deactivated for {}", direction);
            inner.last_cleared_at = Some(now);
        }
        inner.state = PreemptionState::Idle;
    }

    pub fn get_state(&self) -> EmergencySnapshot {
        self.state_at(now_secs())
    }

    pub fn state_at(&self, now: f64) -> EmergencySnapshot {
        let mut inner = lock(&self.inner);
        self.expire(&mut inner, now);
        match inner.state {
            PreemptionState::Idle => EmergencySnapshot {
                active: false,
                direction: None,
                activated_at: None,
                remaining_seconds: 0.0,
            },
            PreemptionState::Active {
                direction,
                activated_at,
            } => EmergencySnapshot {
                active: true,
                direction: Some(direction),
                activated_at: to_datetime(activated_at),
                remaining_seconds: (self.config.timeout_secs - (now - activated_at)).max(0.0),
            },
        }
    }

    /// The only read path the decision engine uses.
    pub fn get_priority_direction(&self) -> Option<Direction> {
        self.priority_direction_at(now_secs())
    }

    pub fn priority_direction_at(&self, now: f64) -> Option<Direction> {
        self.state_at(now).direction
    }

    /// Whether a simulator-detected emergency vehicle may activate the
    /// override now: nothing active and the cooldown since the last
    /// deactivation/expiry has passed.
    pub fn accepts_auto_activation_at(&self, now: f64) -> bool {
        let mut inner = lock(&self.inner);
        self.expire(&mut inner, now);
        if inner.state != PreemptionState::Idle {
            return false;
        }
        match inner.last_cleared_at {
            Some(cleared) => now - cleared >= self.config.auto_detect_cooldown_secs,
            None => true,
        }
    }

    /// Audit events, newest first.
    pub fn get_history(&self) -> Vec<EmergencyEvent> {
        lock(&self.inner).history.iter().cloned().collect()
    }

    fn expire(&self, inner: &mut Inner, now: f64) {
        let (next, expired) = resolve(inner.state, now, self.config.timeout_secs);
        if expired {
            inner.state = next;
            inner.last_cleared_at = Some(now);
            self.record(inner, EmergencyEventKind::EmergencyExpired, None, now);
            info!("Emergency override auto-expired");
        }
    }

    fn record(
        &self,
        inner: &mut Inner,
        event: EmergencyEventKind,
        direction: Option<Direction>,
        now: f64,
    ) {
        if inner.history.len() >= self.config.history_capacity {
            inner.history.pop_back();
        }
        inner.history.push_front(EmergencyEvent {
            event,
            direction,
            timestamp: to_datetime(now).unwrap_or_else(Utc::now),
        });
    }
}

pub(crate) fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub(crate) fn to_datetime(secs: f64) -> Option<DateTime<Utc>> {
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
}
