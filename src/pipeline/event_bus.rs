// src/pipeline/event_bus.rs
//
// Decoupled event system. The control loop publishes what happened each
// tick; observability consumers drain at their own pace.

use crate::alerts::Severity;
use crate::control::DecisionSource;
use crate::types::Direction;
use crate::violations::Violation;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlEvent {
    PhaseSwitched {
        step: u64,
        from: u32,
        to: u32,
        source: DecisionSource,
    },

    EmergencyAutoActivated {
        step: u64,
        vehicle_id: String,
        direction: Direction,
    },

    AlertRaised {
        step: u64,
        severity: Severity,
        message: String,
    },

    ViolationFlagged(Violation),

    LoopStopped {
        steps: u64,
        reason: String,
    },
}

pub struct EventBus {
    events: VecDeque<ControlEvent>,
    max_pending: usize,
    dropped: u64,
}

impl EventBus {
    pub fn new(max_pending: usize) -> Self {
        let max_pending = max_pending.max(1);
        Self {
            events: VecDeque::with_capacity(max_pending),
            max_pending,
            dropped: 0,
        }
    }

    pub fn publish(&mut self, event: ControlEvent) {
        if self.events.len() >= self.max_pending {
            if self.dropped == 0 {
                warn!(
                    "Event bus full ({} events), dropping oldest",
                    self.max_pending
                );
            }
            self.dropped += 1;
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn drain(&mut self) -> Vec<ControlEvent> {
        self.events.drain(..).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.events.len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stopped(steps: u64) -> ControlEvent {
        ControlEvent::LoopStopped {
            steps,
            reason: "test".into(),
        }
    }

    #[test]
    fn test_drops_oldest_when_full() {
        let mut bus = EventBus::new(2);
        bus.publish(stopped(1));
        bus.publish(stopped(2));
        bus.publish(stopped(3));
        assert_eq!(bus.pending_count(), 2);
        assert_eq!(bus.dropped_count(), 1);
        let events = bus.drain();
        assert!(matches!(events[0], ControlEvent::LoopStopped { steps: 2, .. }));
        assert_eq!(bus.pending_count(), 0);
    }

    #[test]
    fn test_serializes_with_event_tag() {
        let json = serde_json::to_value(ControlEvent::PhaseSwitched {
            step: 4,
            from: 3,
            to: 4,
            source: DecisionSource::Policy,
        })
        .unwrap();
        assert_eq!(json["event"], "phase_switched");
        assert_eq!(json["source"], "policy");
    }
}
