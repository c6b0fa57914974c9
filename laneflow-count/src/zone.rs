//! Counting zones: transitions between two rectangles.

use std::collections::HashMap;

use laneflow_types::{Direction, Track, ZoneDirections, ZonesConfig, TRACK_TTL};

use crate::CountHit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ZoneKind {
    Down,
    Up,
}

#[derive(Debug)]
struct TrackState {
    counted_forward: bool,
    counted_return: bool,
    last_zone: Option<ZoneKind>,
    last_event_time: f64,
    last_seen: f64,
}

impl TrackState {
    fn new(now: f64) -> Self {
        Self {
            counted_forward: false,
            counted_return: false,
            last_zone: None,
            last_event_time: f64::NEG_INFINITY,
            last_seen: now,
        }
    }

    fn counted(&self, direction: Direction) -> bool {
        match direction {
            Direction::Forward => self.counted_forward,
            Direction::Return => self.counted_return,
            Direction::Undefined => true,
        }
    }

    fn mark_counted(&mut self, direction: Direction) {
        match direction {
            Direction::Forward => self.counted_forward = true,
            Direction::Return => self.counted_return = true,
            Direction::Undefined => {}
        }
    }
}

/// Counts entries into the `down`/`up` rectangles.
///
/// An event fires when a track's centroid lands in a zone it was not in on
/// the previous frame, mapped through the configured per-zone direction.
/// Events within the cooldown of the previous accepted event on the same
/// track are rejected, including directions not yet counted. Containment is
/// tested `down` first, so a point inside both rectangles belongs to `down`.
pub struct ZoneCounter {
    zones: ZonesConfig,
    directions: ZoneDirections,
    /// Seconds between accepted events per track.
    cooldown: f64,
    states: HashMap<i64, TrackState>,
}

impl ZoneCounter {
    pub fn new(zones: ZonesConfig, directions: ZoneDirections, cooldown: f64) -> Self {
        Self {
            zones,
            directions,
            cooldown,
            states: HashMap::new(),
        }
    }

    fn classify(&self, point: (f32, f32), dims: (u32, u32)) -> Option<ZoneKind> {
        if rect_contains(&self.zones.down, point, dims) {
            Some(ZoneKind::Down)
        } else if rect_contains(&self.zones.up, point, dims) {
            Some(ZoneKind::Up)
        } else {
            None
        }
    }

    /// Process one frame of tracks; returns the accepted transitions.
    pub fn update(&mut self, tracks: &[Track], dims: (u32, u32), now: f64) -> Vec<CountHit> {
        let mut hits = Vec::new();

        for track in tracks {
            let zone = self.classify(track.bbox.center(), dims);
            let state = self
                .states
                .entry(track.id)
                .or_insert_with(|| TrackState::new(now));
            state.last_seen = now;

            let was = state.last_zone;
            state.last_zone = zone;

            let entered = match zone {
                Some(z) if was != Some(z) => z,
                _ => continue,
            };

            if now - state.last_event_time < self.cooldown {
                continue;
            }

            let direction = match entered {
                ZoneKind::Down => self.directions.down,
                ZoneKind::Up => self.directions.up,
            };
            if state.counted(direction) {
                continue;
            }
            state.mark_counted(direction);
            state.last_event_time = now;

            hits.push(CountHit {
                track_id: track.id,
                class_name: track.class_name.clone(),
                category: track.category(),
                direction,
            });
        }

        hits
    }

    /// Drop state for tracks unseen longer than the TTL.
    pub fn retire_stale(&mut self, now: f64) {
        self.states.retain(|_, s| now - s.last_seen <= TRACK_TTL);
    }

    pub fn tracked(&self) -> usize {
        self.states.len()
    }
}

fn rect_contains(rect: &[f32; 4], point: (f32, f32), dims: (u32, u32)) -> bool {
    let (width, height) = (dims.0 as f32, dims.1 as f32);
    let x1 = rect[0] * width;
    let y1 = rect[1] * height;
    let x2 = rect[2] * width;
    let y2 = rect[3] * height;
    point.0 >= x1 && point.0 <= x2 && point.1 >= y1 && point.1 <= y2
}

#[cfg(test)]
mod tests {
    use super::*;
    use laneflow_types::BBox;

    const DIMS: (u32, u32) = (1000, 1000);

    fn counter() -> ZoneCounter {
        let zones = ZonesConfig {
            down: [0.1, 0.6, 0.9, 0.95],
            up: [0.1, 0.05, 0.9, 0.4],
        };
        ZoneCounter::new(zones, ZoneDirections::default(), 0.8)
    }

    fn car_at(id: i64, cx: f32, cy: f32) -> Track {
        Track {
            id,
            bbox: BBox::new(cx - 10.0, cy - 10.0, cx + 10.0, cy + 10.0),
            class_name: "car".to_string(),
            confidence: 0.9,
        }
    }

    #[test]
    fn entering_down_zone_counts_forward() {
        let mut c = counter();
        let hits = c.update(&[car_at(3, 500.0, 700.0)], DIMS, 0.0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].direction, Direction::Forward);
    }

    #[test]
    fn staying_in_a_zone_fires_nothing() {
        let mut c = counter();
        c.update(&[car_at(3, 500.0, 700.0)], DIMS, 0.0);
        let hits = c.update(&[car_at(3, 510.0, 710.0)], DIMS, 0.1);
        assert!(hits.is_empty());
    }

    #[test]
    fn cooldown_then_idempotence_suppresses_oscillation() {
        // S3: down at t=0 (counted), up at t=0.3 (cooldown), down again at
        // t=0.9 (already counted Forward) -> exactly one event
        let mut c = counter();
        let hits = c.update(&[car_at(3, 500.0, 700.0)], DIMS, 0.0);
        assert_eq!(hits.len(), 1);

        let hits = c.update(&[car_at(3, 500.0, 200.0)], DIMS, 0.3);
        assert!(hits.is_empty(), "cooldown must reject the up transition");

        let hits = c.update(&[car_at(3, 500.0, 700.0)], DIMS, 0.9);
        assert!(hits.is_empty(), "forward already counted for this track");
    }

    #[test]
    fn second_direction_counts_after_cooldown() {
        let mut c = counter();
        c.update(&[car_at(4, 500.0, 700.0)], DIMS, 0.0);
        let hits = c.update(&[car_at(4, 500.0, 200.0)], DIMS, 1.0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].direction, Direction::Return);
    }

    #[test]
    fn overlapping_zones_resolve_to_down() {
        let zones = ZonesConfig {
            down: [0.0, 0.0, 1.0, 1.0],
            up: [0.0, 0.0, 1.0, 1.0],
        };
        let mut c = ZoneCounter::new(zones, ZoneDirections::default(), 0.8);
        let hits = c.update(&[car_at(1, 500.0, 500.0)], DIMS, 0.0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].direction, Direction::Forward);
    }

    #[test]
    fn outside_both_zones_is_no_event() {
        let mut c = counter();
        let hits = c.update(&[car_at(5, 500.0, 450.0)], DIMS, 0.0);
        assert!(hits.is_empty());
    }

    #[test]
    fn stale_tracks_are_retired() {
        let mut c = counter();
        c.update(&[car_at(1, 500.0, 700.0)], DIMS, 0.0);
        c.retire_stale(3.0);
        assert_eq!(c.tracked(), 0);
    }
}
