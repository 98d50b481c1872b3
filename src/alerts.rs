// src/alerts.rs
//
// Congestion severity from a metrics snapshot.
//
//   critical  queue > 20 or wait > 360s
//   heavy     queue > 10 or wait > 180s
//   moderate  queue > 5  or wait > 60s
//   normal    otherwise
//
// Checked top-down, first match wins. Every evaluation replaces the
// current record; only non-normal records enter the bounded history.

use crate::sync::lock;
use crate::types::{AlertConfig, Direction, DirectionCounts};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Normal,
    Moderate,
    Heavy,
    Critical,
}

impl Severity {
    pub fn level(&self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Moderate => 1,
            Self::Heavy => 2,
            Self::Critical => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Moderate => "moderate",
            Self::Heavy => "heavy",
            Self::Critical => "critical",
        }
    }
}

/// Input to the classifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficSnapshot {
    pub queue_length: u32,
    /// Aggregate waiting time, seconds.
    pub waiting_time: f64,
    pub vehicle_count: DirectionCounts,
}

pub fn classify(queue_length: u32, waiting_time: f64) -> Severity {
    if queue_length > 20 || waiting_time > 360.0 {
        Severity::Critical
    } else if queue_length > 10 || waiting_time > 180.0 {
        Severity::Heavy
    } else if queue_length > 5 || waiting_time > 60.0 {
        Severity::Moderate
    } else {
        Severity::Normal
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub severity: Severity,
    pub severity_level: u8,
    pub message: String,
    pub junction: String,
    /// Most congested approach; `None` only for the "no data yet" record.
    pub direction: Option<Direction>,
    pub queue_length: u32,
    pub waiting_time: f64,
    pub vehicle_counts: DirectionCounts,
    pub timestamp: DateTime<Utc>,
}

struct AlertState {
    current: Option<AlertRecord>,
    history: VecDeque<AlertRecord>,
}

pub struct AlertEngine {
    junction: String,
    capacity: usize,
    state: Mutex<AlertState>,
}

impl AlertEngine {
    pub fn new(junction: impl Into<String>, config: &AlertConfig) -> Self {
        let capacity = config.history_capacity.max(1);
        Self {
            junction: junction.into(),
            capacity,
            state: Mutex::new(AlertState {
                current: None,
                history: VecDeque::with_capacity(capacity),
            }),
        }
    }

    pub fn evaluate(&self, snapshot: &TrafficSnapshot) -> AlertRecord {
        self.evaluate_at(snapshot, Utc::now())
    }

    pub fn evaluate_at(&self, snapshot: &TrafficSnapshot, timestamp: DateTime<Utc>) -> AlertRecord {
        let severity = classify(snapshot.queue_length, snapshot.waiting_time);
        let direction = snapshot.vehicle_count.most_congested();

        let record = AlertRecord {
            severity,
            severity_level: severity.level(),
            message: self.message(severity, direction, snapshot),
            junction: self.junction.clone(),
            direction: Some(direction),
            queue_length: snapshot.queue_length,
            waiting_time: (snapshot.waiting_time * 10.0).round() / 10.0,
            vehicle_counts: snapshot.vehicle_count,
            timestamp,
        };

        match severity {
            Severity::Normal => {}
            Severity::Critical => warn!("🔴 {}", record.message),
            _ => info!("🟡 {}", record.message),
        }

        let mut state = lock(&self.state);
        state.current = Some(record.clone());
        if severity != Severity::Normal {
            if state.history.len() >= self.capacity {
                state.history.pop_back();
            }
            state.history.push_front(record.clone());
        }
        record
    }

    /// Latest record, or a "no data yet" normal record before the first
    /// evaluation.
    pub fn get_current(&self) -> AlertRecord {
        let state = lock(&self.state);
        state.current.clone().unwrap_or_else(|| AlertRecord {
            severity: Severity::Normal,
            severity_level: 0,
            message: "No traffic data available yet.".to_string(),
            junction: self.junction.clone(),
            direction: None,
            queue_length: 0,
            waiting_time: 0.0,
            vehicle_counts: DirectionCounts::default(),
            timestamp: Utc::now(),
        })
    }

    /// Non-normal records, newest first.
    pub fn get_history(&self, limit: usize) -> Vec<AlertRecord> {
        lock(&self.state).history.iter().take(limit).cloned().collect()
    }

    fn message(&self, severity: Severity, direction: Direction, s: &TrafficSnapshot) -> String {
        let junction = &self.junction;
        let queue = s.queue_length;
        let wait = s.waiting_time;
        match severity {
            Severity::Normal => format!("Traffic flowing normally at {junction}."),
            Severity::Moderate => format!(
                "Moderate congestion at {junction} {direction} approach: \
                 queue {queue} vehicles, avg wait {wait:.0}s."
            ),
            Severity::Heavy => format!(
                "Heavy congestion at {junction} {direction} approach: \
                 queue {queue} vehicles, average waiting time exceeds {wait:.0} seconds. \
                 Consider extending {direction} green phase."
            ),
            Severity::Critical => format!(
                "CRITICAL congestion at {junction} {direction} approach: \
                 queue {queue} vehicles, average waiting time exceeds {:.1} minutes. \
                 Immediate intervention recommended.",
                wait / 60.0
            ),
        }
    }
}
