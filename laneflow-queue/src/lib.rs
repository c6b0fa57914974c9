//! Queue dwell-time tracking.
//!
//! Per-track state machine over a user-defined polygon. Membership is tested
//! on the foot point (bottom-center of the bounding box) with frame-count
//! debounce in both directions, so brief occlusions and fast pass-throughs
//! do not produce spurious events. A completed wait shorter than the
//! configured minimum is discarded; everything else is emitted as a
//! [`QueueEvent`] for persistence.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use laneflow_types::{QueueConfig, QueueEvent, Track};

/// Consecutive frames inside the polygon before a track enters the queue.
pub const ENTER_FRAMES: u32 = 3;
/// Consecutive frames outside before a queued track is finalized. More
/// tolerant than entry so momentary occlusion does not end a wait.
pub const EXIT_FRAMES: u32 = 12;

/// Trail points kept per vehicle for rendering.
const TRAIL_LEN: usize = 60;
/// Completed waits kept for the rolling statistics.
const COMPLETED_KEEP: usize = 200;
/// Window for the "recent average wait" statistic.
const RECENT_WINDOW_SECS: f64 = 300.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePhase {
    Idle,
    InQueue,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Normal,
    Warning,
    Critical,
}

impl QueueStatus {
    pub fn label(&self) -> &'static str {
        match self {
            QueueStatus::Normal => "Normal",
            QueueStatus::Warning => "Warning",
            QueueStatus::Critical => "Critical",
        }
    }
}

#[derive(Debug)]
struct VehicleState {
    phase: QueuePhase,
    entry_time: f64,
    current_wait: f64,
    last_pos: (f32, f32),
    history: VecDeque<(f32, f32)>,
    frames_inside: u32,
    frames_outside: u32,
    class_name: String,
}

impl VehicleState {
    fn new(foot: (f32, f32), class_name: String) -> Self {
        Self {
            phase: QueuePhase::Idle,
            entry_time: 0.0,
            current_wait: 0.0,
            last_pos: foot,
            history: VecDeque::with_capacity(TRAIL_LEN),
            frames_inside: 0,
            frames_outside: 0,
            class_name,
        }
    }
}

/// Live statistics over the queue area.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueStats {
    /// Vehicles currently in the queue.
    pub waiting_count: usize,
    /// Mean of completed waits finalized within the last five minutes.
    pub avg_wait_recent: f64,
    /// Longest wait among vehicles currently queued.
    pub max_wait_current: f64,
    /// Longest wait seen this session, current or completed.
    pub max_wait_session: f64,
    pub status: QueueStatus,
}

/// Per-vehicle data handed to the scene composer.
#[derive(Debug, Clone)]
pub struct QueueVehicleRender {
    pub track_id: i64,
    pub wait: f64,
    pub last_pos: (f32, f32),
    pub trail: Vec<(f32, f32)>,
}

/// Geometry and vehicles for rendering, in pixels of the processed frame.
#[derive(Debug, Clone, Default)]
pub struct QueueRenderData {
    pub polygon: Vec<(f32, f32)>,
    pub entry_line: Option<[(f32, f32); 2]>,
    pub exit_line: Option<[(f32, f32); 2]>,
    pub status: Option<QueueStatus>,
    pub vehicles: Vec<QueueVehicleRender>,
}

pub struct QueueManager {
    config: QueueConfig,
    vehicles: HashMap<i64, VehicleState>,
    /// (wait_seconds, finalized_at) of persisted waits, newest last.
    completed: VecDeque<(f64, f64)>,
    status: QueueStatus,
    max_wait_current: f64,
    /// Pixel geometry cache, rebuilt when the frame size changes.
    geo: Option<GeoCache>,
}

struct GeoCache {
    dims: (u32, u32),
    polygon: Vec<(f32, f32)>,
    entry_line: Option<[(f32, f32); 2]>,
    exit_line: Option<[(f32, f32); 2]>,
}

impl QueueManager {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            vehicles: HashMap::new(),
            completed: VecDeque::new(),
            status: QueueStatus::Normal,
            max_wait_current: 0.0,
            geo: None,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: QueueConfig) {
        self.config = config;
        self.geo = None;
    }

    fn geometry(&mut self, dims: (u32, u32)) -> &GeoCache {
        let rebuild = match &self.geo {
            Some(cache) => cache.dims != dims,
            None => true,
        };
        if rebuild {
            let (w, h) = (dims.0 as f32, dims.1 as f32);
            let scale_pt = |p: &[f32; 2]| (p[0] * w, p[1] * h);
            let scale_line =
                |l: &[[f32; 2]; 2]| [(l[0][0] * w, l[0][1] * h), (l[1][0] * w, l[1][1] * h)];
            self.geo = Some(GeoCache {
                dims,
                polygon: self.config.polygon.iter().map(scale_pt).collect(),
                entry_line: self.config.entry_line.as_ref().map(scale_line),
                exit_line: self.config.exit_line.as_ref().map(scale_line),
            });
        }
        self.geo.as_ref().unwrap()
    }

    /// Process one frame of tracks; returns the completed waits to persist.
    pub fn update(&mut self, tracks: &[Track], dims: (u32, u32), now: f64) -> Vec<QueueEvent> {
        let min_wait = self.config.min_wait_time;
        let has_polygon = self.config.has_polygon();
        let polygon = self.geometry(dims).polygon.clone();

        let mut events = Vec::new();
        let mut active: HashSet<i64> = HashSet::with_capacity(tracks.len());

        for track in tracks {
            let foot = track.bbox.foot();
            active.insert(track.id);

            let vehicle = self
                .vehicles
                .entry(track.id)
                .or_insert_with(|| VehicleState::new(foot, track.class_name.clone()));
            vehicle.last_pos = foot;
            if vehicle.history.len() == TRAIL_LEN {
                vehicle.history.pop_front();
            }
            vehicle.history.push_back(foot);

            let inside = has_polygon && point_in_polygon(foot, &polygon);

            match vehicle.phase {
                QueuePhase::Idle => {
                    if inside {
                        vehicle.frames_inside += 1;
                        vehicle.frames_outside = 0;
                        if vehicle.frames_inside >= ENTER_FRAMES {
                            vehicle.phase = QueuePhase::InQueue;
                            vehicle.entry_time = now;
                            vehicle.current_wait = 0.0;
                            vehicle.frames_inside = 0;
                            debug!("track {} entered the queue", track.id);
                        }
                    } else {
                        vehicle.frames_inside = 0;
                    }
                }
                QueuePhase::InQueue => {
                    vehicle.current_wait = now - vehicle.entry_time;
                    if !inside {
                        vehicle.frames_outside += 1;
                        vehicle.frames_inside = 0;
                        if vehicle.frames_outside >= EXIT_FRAMES {
                            if let Some(ev) = finalize(vehicle, track.id, now, min_wait) {
                                events.push(ev);
                            }
                            record_completion(&mut self.completed, vehicle, now, min_wait);
                        }
                    } else {
                        vehicle.frames_outside = 0;
                        vehicle.frames_inside += 1;
                    }
                }
                QueuePhase::Finished => {}
            }
        }

        // tracks the detector no longer reports: a queued vehicle that
        // disappears is treated as having left
        let gone: Vec<i64> = self
            .vehicles
            .keys()
            .filter(|id| !active.contains(id))
            .copied()
            .collect();
        for id in gone {
            if let Some(mut vehicle) = self.vehicles.remove(&id) {
                if vehicle.phase == QueuePhase::InQueue {
                    if let Some(ev) = finalize(&mut vehicle, id, now, min_wait) {
                        events.push(ev);
                    }
                    record_completion(&mut self.completed, &vehicle, now, min_wait);
                }
            }
        }
        self.vehicles.retain(|_, v| v.phase != QueuePhase::Finished);

        self.max_wait_current = self
            .vehicles
            .values()
            .filter(|v| v.phase == QueuePhase::InQueue)
            .map(|v| v.current_wait)
            .fold(0.0, f64::max);

        let threshold = self.config.threshold_seconds;
        self.status = if self.max_wait_current > threshold {
            QueueStatus::Critical
        } else if self.max_wait_current > threshold * 0.5 {
            QueueStatus::Warning
        } else {
            QueueStatus::Normal
        };

        events
    }

    pub fn stats(&self, now: f64) -> QueueStats {
        let waiting_count = self
            .vehicles
            .values()
            .filter(|v| v.phase == QueuePhase::InQueue)
            .count();
        let recent: Vec<f64> = self
            .completed
            .iter()
            .filter(|(_, at)| now - at <= RECENT_WINDOW_SECS)
            .map(|(w, _)| *w)
            .collect();
        let avg_wait_recent = if recent.is_empty() {
            0.0
        } else {
            recent.iter().sum::<f64>() / recent.len() as f64
        };
        let max_completed = self
            .completed
            .iter()
            .map(|(w, _)| *w)
            .fold(0.0, f64::max);

        QueueStats {
            waiting_count,
            avg_wait_recent,
            max_wait_current: self.max_wait_current,
            max_wait_session: max_completed.max(self.max_wait_current),
            status: self.status,
        }
    }

    pub fn render_data(&self) -> QueueRenderData {
        let Some(geo) = &self.geo else {
            return QueueRenderData::default();
        };
        let vehicles = self
            .vehicles
            .iter()
            .filter(|(_, v)| v.phase == QueuePhase::InQueue)
            .map(|(id, v)| QueueVehicleRender {
                track_id: *id,
                wait: v.current_wait,
                last_pos: v.last_pos,
                trail: v.history.iter().copied().collect(),
            })
            .collect();
        QueueRenderData {
            polygon: geo.polygon.clone(),
            entry_line: geo.entry_line,
            exit_line: geo.exit_line,
            status: Some(self.status),
            vehicles,
        }
    }
}

/// Close out a wait; `None` means it was too short and is discarded.
fn finalize(vehicle: &mut VehicleState, track_id: i64, now: f64, min_wait: f64) -> Option<QueueEvent> {
    vehicle.phase = QueuePhase::Finished;
    let wait = now - vehicle.entry_time;
    if wait < min_wait {
        debug!("track {track_id} waited {wait:.2}s, below minimum, discarded");
        return None;
    }
    Some(QueueEvent {
        track_id,
        entry: vehicle.entry_time,
        exit: now,
        wait_seconds: wait,
        vehicle_class: vehicle.class_name.clone(),
    })
}

fn record_completion(
    completed: &mut VecDeque<(f64, f64)>,
    vehicle: &VehicleState,
    now: f64,
    min_wait: f64,
) {
    let wait = now - vehicle.entry_time;
    if wait < min_wait {
        return;
    }
    if completed.len() == COMPLETED_KEEP {
        completed.pop_front();
    }
    completed.push_back((wait, now));
}

/// Ray-casting containment test; points on an edge may land either way.
fn point_in_polygon(point: (f32, f32), polygon: &[(f32, f32)]) -> bool {
    if polygon.len() < 3 {
        return false;
    }
    let (px, py) = point;
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (xi, yi) = polygon[i];
        let (xj, yj) = polygon[j];
        if ((yi > py) != (yj > py)) && (px < (xj - xi) * (py - yi) / (yj - yi) + xi) {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;
    use laneflow_types::BBox;

    const DIMS: (u32, u32) = (100, 100);

    // square covering the lower half of the frame
    fn config(min_wait: f64) -> QueueConfig {
        QueueConfig {
            polygon: vec![[0.0, 0.5], [1.0, 0.5], [1.0, 1.0], [0.0, 1.0]],
            min_wait_time: min_wait,
            ..QueueConfig::default()
        }
    }

    fn car_with_foot(id: i64, fx: f32, fy: f32) -> Track {
        Track {
            id,
            bbox: BBox::new(fx - 5.0, fy - 10.0, fx + 5.0, fy),
            class_name: "car".to_string(),
            confidence: 0.9,
        }
    }

    fn drive_inside(qm: &mut QueueManager, id: i64, frames: u32, t0: f64, dt: f64) -> f64 {
        let mut now = t0;
        for _ in 0..frames {
            qm.update(&[car_with_foot(id, 50.0, 80.0)], DIMS, now);
            now += dt;
        }
        now
    }

    #[test]
    fn enter_debounce_requires_three_frames() {
        let mut qm = QueueManager::new(config(5.0));
        qm.update(&[car_with_foot(1, 50.0, 80.0)], DIMS, 0.0);
        qm.update(&[car_with_foot(1, 50.0, 80.0)], DIMS, 0.03);
        assert_eq!(qm.stats(0.06).waiting_count, 0);
        qm.update(&[car_with_foot(1, 50.0, 80.0)], DIMS, 0.06);
        assert_eq!(qm.stats(0.09).waiting_count, 1);
    }

    #[test]
    fn short_wait_is_discarded() {
        // S4: inside ~3.2s then leaves; min_wait 5s -> nothing persisted
        let mut qm = QueueManager::new(config(5.0));
        let now = drive_inside(&mut qm, 11, 33, 0.0, 0.1); // ~3.2s inside
        let mut events = Vec::new();
        let mut t = now;
        for _ in 0..EXIT_FRAMES {
            events.extend(qm.update(&[car_with_foot(11, 50.0, 20.0)], DIMS, t));
            t += 0.03;
        }
        assert!(events.is_empty());
        assert_eq!(qm.stats(t).waiting_count, 0);
    }

    #[test]
    fn long_wait_is_emitted_with_consistent_times() {
        // S5 shape: queued for 42s, then leaves
        let mut qm = QueueManager::new(config(5.0));
        drive_inside(&mut qm, 11, 3, 0.0, 0.1); // enters at t=0.2
        let entry = 0.2;
        qm.update(&[car_with_foot(11, 50.0, 80.0)], DIMS, entry + 42.0);

        let mut events = Vec::new();
        let mut t = entry + 42.0;
        for _ in 0..EXIT_FRAMES {
            t += 0.01;
            events.extend(qm.update(&[car_with_foot(11, 50.0, 20.0)], DIMS, t));
        }
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.track_id, 11);
        assert_eq!(ev.vehicle_class, "car");
        assert!((ev.wait_seconds - 42.0).abs() < 0.5);
        assert!((ev.exit - ev.entry - ev.wait_seconds).abs() < 1e-9);
        assert!(ev.wait_seconds >= 5.0);
    }

    #[test]
    fn min_wait_boundary() {
        for (wait, expect_event) in [(4.99, false), (5.01, true)] {
            let mut qm = QueueManager::new(config(5.0));
            drive_inside(&mut qm, 1, 3, 0.0, 0.01); // enters at t=0.02
            let exit_at = 0.02 + wait;
            // disappearance finalizes immediately at `exit_at`
            let events = qm.update(&[], DIMS, exit_at);
            assert_eq!(
                !events.is_empty(),
                expect_event,
                "wait of {wait}s should{} emit",
                if expect_event { "" } else { " not" }
            );
        }
    }

    #[test]
    fn disappearance_finalizes_immediately() {
        let mut qm = QueueManager::new(config(5.0));
        drive_inside(&mut qm, 7, 3, 0.0, 0.1); // enters at t=0.2
        let events = qm.update(&[], DIMS, 10.2);
        assert_eq!(events.len(), 1);
        assert!((events[0].wait_seconds - 10.0).abs() < 1e-6);
        assert_eq!(qm.stats(10.2).waiting_count, 0);
    }

    #[test]
    fn occlusion_shorter_than_exit_debounce_keeps_the_wait() {
        let mut qm = QueueManager::new(config(5.0));
        drive_inside(&mut qm, 2, 3, 0.0, 0.1);
        // a few frames outside, then back in: still queued
        let mut t = 0.3;
        for _ in 0..(EXIT_FRAMES - 1) {
            qm.update(&[car_with_foot(2, 50.0, 20.0)], DIMS, t);
            t += 0.03;
        }
        qm.update(&[car_with_foot(2, 50.0, 80.0)], DIMS, t);
        assert_eq!(qm.stats(t).waiting_count, 1);
    }

    #[test]
    fn status_ramps_with_longest_current_wait() {
        let mut cfg = config(5.0);
        cfg.threshold_seconds = 60.0;
        let mut qm = QueueManager::new(cfg);
        drive_inside(&mut qm, 1, 3, 0.0, 0.1); // enters at t=0.2

        qm.update(&[car_with_foot(1, 50.0, 80.0)], DIMS, 10.0);
        assert_eq!(qm.stats(10.0).status, QueueStatus::Normal);

        qm.update(&[car_with_foot(1, 50.0, 80.0)], DIMS, 40.0);
        assert_eq!(qm.stats(40.0).status, QueueStatus::Warning);

        qm.update(&[car_with_foot(1, 50.0, 80.0)], DIMS, 70.0);
        assert_eq!(qm.stats(70.0).status, QueueStatus::Critical);
    }

    #[test]
    fn recent_average_ignores_old_completions() {
        let mut qm = QueueManager::new(config(5.0));
        drive_inside(&mut qm, 1, 3, 0.0, 0.1);
        qm.update(&[], DIMS, 10.2); // completed wait of 10s at t=10.2
        let stats = qm.stats(11.0);
        assert!((stats.avg_wait_recent - 10.0).abs() < 0.1);
        // five minutes later the completion has aged out of the window
        let stats = qm.stats(10.2 + 301.0);
        assert_eq!(stats.avg_wait_recent, 0.0);
        assert!((stats.max_wait_session - 10.0).abs() < 0.1);
    }

    #[test]
    fn no_polygon_means_no_queue() {
        let mut cfg = config(5.0);
        cfg.polygon.clear();
        let mut qm = QueueManager::new(cfg);
        drive_inside(&mut qm, 1, 10, 0.0, 0.1);
        assert_eq!(qm.stats(1.0).waiting_count, 0);
    }

    #[test]
    fn point_in_polygon_basics() {
        let square = vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        assert!(point_in_polygon((5.0, 5.0), &square));
        assert!(!point_in_polygon((15.0, 5.0), &square));
        assert!(!point_in_polygon((-1.0, 5.0), &square));
        // concave polygon
        let concave = vec![
            (0.0, 0.0),
            (10.0, 0.0),
            (10.0, 10.0),
            (5.0, 5.0),
            (0.0, 10.0),
        ];
        assert!(point_in_polygon((2.0, 3.0), &concave));
        assert!(!point_in_polygon((5.0, 9.0), &concave));
    }
}
