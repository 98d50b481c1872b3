// src/violations.rs
//
// Per-camera stationary-vehicle tracker for illegal parking.
//
// Matching is greedy nearest-centroid, one detection at a time:
//   - nearest existing track (first found wins a distance tie)
//   - closer than `distance_threshold` → same vehicle, refresh position
//   - otherwise → new track
// A track can absorb more than one detection in the same update. After all
// detections are processed, tracks that were not matched and have not been
// seen for `stale_after_secs` are dropped.
//
// Dwell is measured from `first_seen`; a track is flagged at most once.

use crate::sync::lock;
use crate::types::ViolationConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::{debug, info};

// ============================================================================
// TYPES
// ============================================================================

/// Detector output for one object: centroid plus its bbox `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub cx: f64,
    pub cy: f64,
    pub bbox: [f64; 4],
}

impl Detection {
    pub fn from_bbox(bbox: [f64; 4]) -> Self {
        Self {
            cx: (bbox[0] + bbox[2]) / 2.0,
            cy: (bbox[1] + bbox[3]) / 2.0,
            bbox,
        }
    }

    pub fn at(cx: f64, cy: f64) -> Self {
        Self {
            cx,
            cy,
            bbox: [cx, cy, cx, cy],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    fn distance_to(&self, x: f64, y: f64) -> f64 {
        ((self.x - x).powi(2) + (self.y - y).powi(2)).sqrt()
    }
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: u64,
    pub position: Position,
    /// Seconds since the Unix epoch.
    pub first_seen: f64,
    pub last_seen: f64,
    pub flagged: bool,
}

impl Track {
    fn dwell(&self, now: f64) -> f64 {
        now - self.first_seen
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub camera: String,
    pub position: Position,
    /// Dwell in seconds, one decimal.
    pub duration: f64,
    pub severity: ViolationSeverity,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StationaryVehicle {
    pub position: Position,
    pub duration: f64,
    pub flagged: bool,
}

// ============================================================================
// TRACKER
// ============================================================================

struct CameraTracks {
    tracks: HashMap<String, Vec<Track>>,
    next_id: u64,
}

pub struct ViolationTracker {
    config: ViolationConfig,
    cameras: Mutex<CameraTracks>,
    violations: Mutex<VecDeque<Violation>>,
}

impl ViolationTracker {
    pub fn new(config: ViolationConfig) -> Self {
        Self {
            violations: Mutex::new(VecDeque::with_capacity(config.history_capacity)),
            cameras: Mutex::new(CameraTracks {
                tracks: HashMap::new(),
                next_id: 1,
            }),
            config,
        }
    }

    pub fn update(&self, camera: &str, detections: &[Detection]) -> Vec<Violation> {
        self.update_at(camera, detections, crate::emergency::now_secs())
    }

    /// Feed one frame's detections for `camera`. Returns the violations
    /// flagged by this update.
    pub fn update_at(&self, camera: &str, detections: &[Detection], now: f64) -> Vec<Violation> {
        let mut flagged = Vec::new();
        {
            let mut guard = lock(&self.cameras);
            let state = &mut *guard;
            let tracks = state.tracks.entry(camera.to_string()).or_default();
            let mut matched = vec![false; tracks.len()];

            for det in detections {
                let mut best: Option<(usize, f64)> = None;
                for (i, track) in tracks.iter().enumerate() {
                    let dist = track.position.distance_to(det.cx, det.cy);
                    if best.map_or(true, |(_, d)| dist < d) {
                        best = Some((i, dist));
                    }
                }

                match best {
                    Some((i, dist)) if dist < self.config.distance_threshold => {
                        let track = &mut tracks[i];
                        track.position = Position { x: det.cx, y: det.cy };
                        track.last_seen = now;
                        matched[i] = true;

                        let duration = track.dwell(now);
                        if duration >= self.config.dwell_threshold_secs && !track.flagged {
                            track.flagged = true;
                            flagged.push(self.violation(camera, track.position, duration, now));
                        }
                    }
                    _ => {
                        debug!("[{}] new track #{} at ({:.1}, {:.1})", camera, state.next_id, det.cx, det.cy);
                        tracks.push(Track {
                            id: state.next_id,
                            position: Position { x: det.cx, y: det.cy },
                            first_seen: now,
                            last_seen: now,
                            flagged: false,
                        });
                        state.next_id += 1;
                        matched.push(true);
                    }
                }
            }

            let stale_after = self.config.stale_after_secs;
            let mut keep = matched.into_iter();
            tracks.retain(|t| {
                let was_matched = keep.next().unwrap_or(false);
                was_matched || now - t.last_seen <= stale_after
            });
        }

        if !flagged.is_empty() {
            let mut violations = lock(&self.violations);
            for v in &flagged {
                info!(
                    "🅿️ Violation on {}: stationary {:.1}s at ({:.1}, {:.1}) [{:?}]",
                    v.camera, v.duration, v.position.x, v.position.y, v.severity
                );
                if violations.len() >= self.config.history_capacity {
                    violations.pop_back();
                }
                violations.push_front(v.clone());
            }
        }
        flagged
    }

    /// Newest first.
    pub fn get_violations(&self, limit: usize) -> Vec<Violation> {
        lock(&self.violations).iter().take(limit).cloned().collect()
    }

    pub fn get_active_stationary(&self) -> HashMap<String, Vec<StationaryVehicle>> {
        self.active_stationary_at(crate::emergency::now_secs())
    }

    /// Tracks whose dwell has reached the threshold, per camera. Cameras
    /// with none are omitted.
    pub fn active_stationary_at(&self, now: f64) -> HashMap<String, Vec<StationaryVehicle>> {
        let cameras = lock(&self.cameras);
        cameras
            .tracks
            .iter()
            .filter_map(|(camera, tracks)| {
                let stationary: Vec<_> = tracks
                    .iter()
                    .filter(|t| t.dwell(now) >= self.config.dwell_threshold_secs)
                    .map(|t| StationaryVehicle {
                        position: t.position,
                        duration: round1(t.dwell(now)),
                        flagged: t.flagged,
                    })
                    .collect();
                (!stationary.is_empty()).then(|| (camera.clone(), stationary))
            })
            .collect()
    }

    pub fn track_count(&self, camera: &str) -> usize {
        lock(&self.cameras).tracks.get(camera).map_or(0, Vec::len)
    }

    fn violation(&self, camera: &str, position: Position, duration: f64, now: f64) -> Violation {
        let severity = if duration < self.config.critical_dwell_secs {
            ViolationSeverity::Warning
        } else {
            ViolationSeverity::Critical
        };
        Violation {
            kind: "illegal_parking",
            camera: camera.to_string(),
            position,
            duration: round1(duration),
            severity,
            timestamp: crate::emergency::to_datetime(now).unwrap_or_else(Utc::now),
        }
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ViolationTracker {
        ViolationTracker::new(ViolationConfig::default())
    }

    /// Same spot every 5 s from `t0` to `t_end` inclusive.
    fn dwell(t: &ViolationTracker, cam: &str, x: f64, y: f64, t0: f64, t_end: f64) -> Vec<Violation> {
        let mut out = Vec::new();
        let mut now = t0;
        while now <= t_end {
            out.extend(t.update_at(cam, &[Detection::at(x, y)], now));
            now += 5.0;
        }
        out
    }

    #[test]
    fn test_detection_from_bbox_uses_center() {
        let d = Detection::from_bbox([10.0, 20.0, 30.0, 60.0]);
        assert_eq!((d.cx, d.cy), (20.0, 40.0));
    }

    #[test]
    fn test_dwell_flags_exactly_one_warning() {
        let t = tracker();
        let flagged = dwell(&t, "cam1", 100.0, 100.0, 0.0, 150.0);
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].severity, ViolationSeverity::Warning);
        assert_eq!(flagged[0].duration, 120.0);
        assert_eq!(flagged[0].kind, "illegal_parking");
        assert_eq!(t.get_violations(10).len(), 1);
    }

    #[test]
    fn test_first_seen_late_is_critical() {
        let t = tracker();
        t.update_at("cam1", &[Detection::at(5.0, 5.0)], 0.0);
        // Pruning runs after matching, so the 200 s gap does not split the track.
        let flagged = t.update_at("cam1", &[Detection::at(6.0, 5.0)], 200.0);
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].severity, ViolationSeverity::Critical);
    }

    #[test]
    fn test_small_drift_stays_on_track() {
        let t = tracker();
        t.update_at("cam1", &[Detection::at(0.0, 0.0)], 0.0);
        t.update_at("cam1", &[Detection::at(10.0, 0.0)], 1.0);
        assert_eq!(t.track_count("cam1"), 1);
        t.update_at("cam1", &[Detection::at(40.0, 0.0)], 2.0);
        assert_eq!(t.track_count("cam1"), 2);
    }

    #[test]
    fn test_stale_track_removed_and_restarted() {
        let t = tracker();
        t.update_at("cam1", &[Detection::at(50.0, 50.0)], 0.0);
        // Empty frame 11 s later prunes the unmatched track.
        t.update_at("cam1", &[], 11.0);
        assert_eq!(t.track_count("cam1"), 0);

        t.update_at("cam1", &[Detection::at(50.0, 50.0)], 12.0);
        let flagged = t.update_at("cam1", &[Detection::at(50.0, 50.0)], 130.0);
        assert!(flagged.is_empty(), "dwell restarted at 12 s");
        let flagged = t.update_at("cam1", &[Detection::at(50.0, 50.0)], 132.0);
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].duration, 120.0);
    }

    #[test]
    fn test_exactly_ten_seconds_is_not_stale() {
        let t = tracker();
        t.update_at("cam1", &[Detection::at(0.0, 0.0)], 0.0);
        t.update_at("cam1", &[], 10.0);
        assert_eq!(t.track_count("cam1"), 1);
    }

    #[test]
    fn test_distance_tie_goes_to_first_track() {
        let t = tracker();
        t.update_at("cam1", &[Detection::at(0.0, 0.0), Detection::at(20.0, 0.0)], 0.0);
        assert_eq!(t.track_count("cam1"), 2);

        // Equidistant (10 units) from both; the older track absorbs it.
        t.update_at("cam1", &[Detection::at(10.0, 0.0)], 1.0);
        let cameras = lock(&t.cameras);
        let tracks = &cameras.tracks["cam1"];
        assert_eq!(tracks[0].position, Position { x: 10.0, y: 0.0 });
        assert_eq!(tracks[1].position, Position { x: 20.0, y: 0.0 });
    }

    #[test]
    fn test_cameras_are_independent() {
        let t = tracker();
        t.update_at("cam1", &[Detection::at(0.0, 0.0)], 0.0);
        t.update_at("cam2", &[Detection::at(0.0, 0.0)], 0.0);
        t.update_at("cam1", &[], 20.0);
        assert_eq!(t.track_count("cam1"), 0);
        assert_eq!(t.track_count("cam2"), 1);
    }

    #[test]
    fn test_active_stationary_view() {
        let t = tracker();
        dwell(&t, "cam1", 1.0, 1.0, 0.0, 125.0);
        t.update_at("cam2", &[Detection::at(9.0, 9.0)], 120.0);

        let active = t.active_stationary_at(125.0);
        assert_eq!(active.len(), 1);
        let cam1 = &active["cam1"];
        assert_eq!(cam1.len(), 1);
        assert!(cam1[0].flagged);
        assert_eq!(cam1[0].duration, 125.0);
    }

    #[test]
    fn test_violation_history_bounded_newest_first() {
        let t = ViolationTracker::new(ViolationConfig {
            history_capacity: 2,
            ..ViolationConfig::default()
        });
        for (i, x) in [0.0, 100.0, 200.0].into_iter().enumerate() {
            let cam = format!("cam{i}");
            t.update_at(&cam, &[Detection::at(x, 0.0)], 0.0);
            t.update_at(&cam, &[Detection::at(x, 0.0)], 120.0 + i as f64);
        }
        let v = t.get_violations(10);
        assert_eq!(v.len(), 2);
        assert_eq!(v[0].camera, "cam2");
        assert_eq!(v[1].camera, "cam1");
    }
}
