// src/control/features.rs
//
// Per-tick feature vector for the forecaster and policy.
//
// Layout (15 fields):
//   0..4    raw counts N, S, E, W
//   4, 5    sin / cos of hour-of-day
//   6       day-of-week (0 = Monday)
//   7..11   count deltas vs. previous tick
//   11..15  rolling means of the raw counts over the last 10 ticks

use super::history::HistoryBuffer;
use crate::types::DirectionCounts;
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::Serialize;
use std::f64::consts::PI;

pub const FEATURE_COUNT: usize = 15;

pub const COUNTS_OFFSET: usize = 0;
pub const HOUR_SIN: usize = 4;
pub const HOUR_COS: usize = 5;
pub const DAY_OF_WEEK: usize = 6;
pub const DELTAS_OFFSET: usize = 7;
pub const MEANS_OFFSET: usize = 11;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector {
    fields: [f64; FEATURE_COUNT],
}

impl FeatureVector {
    pub fn from_fields(fields: [f64; FEATURE_COUNT]) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[f64; FEATURE_COUNT] {
        &self.fields
    }

    pub fn get(&self, idx: usize) -> Option<f64> {
        self.fields.get(idx).copied()
    }

    pub fn counts(&self) -> [f64; 4] {
        self.block(COUNTS_OFFSET)
    }

    pub fn deltas(&self) -> [f64; 4] {
        self.block(DELTAS_OFFSET)
    }

    pub fn means(&self) -> [f64; 4] {
        self.block(MEANS_OFFSET)
    }

    fn block(&self, offset: usize) -> [f64; 4] {
        [
            self.fields[offset],
            self.fields[offset + 1],
            self.fields[offset + 2],
            self.fields[offset + 3],
        ]
    }
}

/// Time reference for a tick.
#[derive(Debug, Clone, Copy)]
pub enum TickTime {
    /// Live camera mode.
    Wall(DateTime<Utc>),
    /// Simulator clock, seconds since simulation start.
    Simulated(f64),
}

impl TickTime {
    pub fn now() -> Self {
        Self::Wall(Utc::now())
    }

    pub fn hour_of_day(&self) -> u32 {
        match self {
            Self::Wall(ts) => ts.hour(),
            Self::Simulated(secs) => ((secs.max(0.0) / 3600.0).floor() as u64 % 24) as u32,
        }
    }

    pub fn day_of_week(&self) -> u32 {
        match self {
            Self::Wall(ts) => ts.weekday().num_days_from_monday(),
            Self::Simulated(secs) => ((secs.max(0.0) / 86_400.0).floor() as u64 % 7) as u32,
        }
    }
}

/// Build the feature vector for the current tick. Pure: the caller appends
/// the result to `history`.
///
/// Rolling means come from the history as it stood before this tick; with
/// fewer than `rolling_window` entries the raw counts stand in.
pub fn build_features(
    current: &DirectionCounts,
    previous: &DirectionCounts,
    time: TickTime,
    history: &HistoryBuffer,
    rolling_window: usize,
) -> FeatureVector {
    let counts = current.as_array().map(f64::from);
    let prev = previous.as_array().map(f64::from);

    let means = if history.len() >= rolling_window {
        [0, 1, 2, 3].map(|i| history.rolling_mean(COUNTS_OFFSET + i, rolling_window))
    } else {
        counts
    };

    let angle = 2.0 * PI * time.hour_of_day() as f64 / 24.0;

    let mut fields = [0.0; FEATURE_COUNT];
    fields[COUNTS_OFFSET..COUNTS_OFFSET + 4].copy_from_slice(&counts);
    fields[HOUR_SIN] = angle.sin();
    fields[HOUR_COS] = angle.cos();
    fields[DAY_OF_WEEK] = time.day_of_week() as f64;
    for i in 0..4 {
        fields[DELTAS_OFFSET + i] = counts[i] - prev[i];
    }
    fields[MEANS_OFFSET..MEANS_OFFSET + 4].copy_from_slice(&means);

    FeatureVector { fields }
}
