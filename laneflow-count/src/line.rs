//! Counting line: per-track crossing detection.

use std::collections::HashMap;

use laneflow_types::{Direction, LineConfig, Track, TRACK_TTL};

use crate::CountHit;

const EPS: f32 = 1e-6;

#[derive(Debug)]
struct TrackState {
    counted_forward: bool,
    counted_return: bool,
    last_center: Option<(f32, f32)>,
    last_seen: f64,
}

impl TrackState {
    fn new(now: f64) -> Self {
        Self {
            counted_forward: false,
            counted_return: false,
            last_center: None,
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

/// Detects crossings of a horizontal segment, one event per track and
/// direction.
///
/// The segment sits at `y_ratio` between `x1_ratio` and `x2_ratio` of the
/// processed frame. Movement from below the line to above it is Forward,
/// the opposite is Return; a point exactly on the line counts as being on
/// the upper side. An optional midpoint reinterprets the crossing by lane
/// instead: left of the midpoint is Forward, right of it Return.
pub struct LineCounter {
    config: LineConfig,
    states: HashMap<i64, TrackState>,
}

impl LineCounter {
    pub fn new(config: LineConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
        }
    }

    pub fn config(&self) -> &LineConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: LineConfig) {
        self.config = config;
    }

    /// Process one frame of tracks; returns the accepted crossings.
    pub fn update(&mut self, tracks: &[Track], dims: (u32, u32), now: f64) -> Vec<CountHit> {
        let (width, height) = (dims.0 as f32, dims.1 as f32);
        let y_line = self.config.y_ratio * height;
        let x_lo = self.config.x1_ratio * width;
        let x_hi = self.config.x2_ratio * width;
        let x_mid = self.config.x_mid_ratio.map(|r| r * width);
        let band = self.config.band_px;

        let mut hits = Vec::new();

        for track in tracks {
            let center = track.bbox.center();
            let state = self
                .states
                .entry(track.id)
                .or_insert_with(|| TrackState::new(now));
            state.last_seen = now;

            let prev = match state.last_center.replace(center) {
                Some(p) => p,
                None => continue,
            };

            let direction = match crossing_direction(prev, center, y_line, x_lo, x_hi, x_mid, band)
            {
                Some(d) => d,
                None => continue,
            };

            let direction = if self.config.invert_direction {
                direction.opposite()
            } else {
                direction
            };

            if !self.config.direction_mode.accepts(direction) {
                continue;
            }
            if state.counted(direction) {
                continue;
            }
            state.mark_counted(direction);

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

/// Raw crossing test between consecutive centroids.
fn crossing_direction(
    prev: (f32, f32),
    curr: (f32, f32),
    y_line: f32,
    x_lo: f32,
    x_hi: f32,
    x_mid: Option<f32>,
    band: f32,
) -> Option<Direction> {
    let (prev_x, prev_y) = prev;
    let (curr_x, curr_y) = curr;

    // both centroids well clear of the line on the same side: nothing to do
    let dp = prev_y - y_line;
    let dc = curr_y - y_line;
    if (dp > band && dc > band) || (dp < -band && dc < -band) {
        return None;
    }

    let denom = curr_y - prev_y;
    if denom.abs() < EPS {
        return None;
    }
    let t = (y_line - prev_y) / denom;
    if !(0.0..=1.0).contains(&t) {
        return None;
    }
    let x_cross = prev_x + t * (curr_x - prev_x);
    if x_cross < x_lo || x_cross > x_hi {
        return None;
    }

    // a point exactly on the line belongs to the lower ("at or below") side
    let raw = if prev_y >= y_line && curr_y < y_line {
        Direction::Forward
    } else if prev_y < y_line && curr_y >= y_line {
        Direction::Return
    } else {
        return None;
    };

    Some(match x_mid {
        Some(mid) => {
            if x_cross < mid {
                Direction::Forward
            } else {
                Direction::Return
            }
        }
        None => raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use laneflow_types::{BBox, Category, DirectionMode};

    const DIMS: (u32, u32) = (1000, 1000);

    // line y=100, x in [10, 200], band 2 px on a 1000x1000 frame
    fn test_config() -> LineConfig {
        LineConfig {
            x1_ratio: 0.01,
            x2_ratio: 0.20,
            y_ratio: 0.10,
            band_px: 2.0,
            x_mid_ratio: None,
            invert_direction: false,
            direction_mode: DirectionMode::Both,
        }
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
    fn forward_crossing_counts_once() {
        let mut counter = LineCounter::new(test_config());

        let hits = counter.update(&[car_at(7, 50.0, 120.0)], DIMS, 0.0);
        assert!(hits.is_empty());

        let hits = counter.update(&[car_at(7, 52.0, 90.0)], DIMS, 0.1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].track_id, 7);
        assert_eq!(hits[0].category, Category::Cars);
        assert_eq!(hits[0].direction, Direction::Forward);

        // oscillating back over the line gives Return, once
        let hits = counter.update(&[car_at(7, 52.0, 120.0)], DIMS, 0.2);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].direction, Direction::Return);

        // re-crossing in either direction is never counted again
        let hits = counter.update(&[car_at(7, 52.0, 90.0)], DIMS, 0.3);
        assert!(hits.is_empty());
        let hits = counter.update(&[car_at(7, 52.0, 120.0)], DIMS, 0.4);
        assert!(hits.is_empty());
    }

    #[test]
    fn return_only_filter_drops_forward_event() {
        let mut config = test_config();
        config.direction_mode = DirectionMode::ReturnOnly;
        let mut counter = LineCounter::new(config);

        counter.update(&[car_at(7, 50.0, 120.0)], DIMS, 0.0);
        let hits = counter.update(&[car_at(7, 52.0, 90.0)], DIMS, 0.1);
        assert!(hits.is_empty());
    }

    #[test]
    fn crossing_outside_segment_is_ignored() {
        let mut counter = LineCounter::new(test_config());
        counter.update(&[car_at(1, 500.0, 120.0)], DIMS, 0.0);
        let hits = counter.update(&[car_at(1, 500.0, 90.0)], DIMS, 0.1);
        assert!(hits.is_empty());
    }

    #[test]
    fn boundary_polarity_prev_exactly_on_line() {
        // prev_y == y_line counts as the lower side: moving up fires Forward
        let mut counter = LineCounter::new(test_config());
        counter.update(&[car_at(1, 50.0, 100.0)], DIMS, 0.0);
        let hits = counter.update(&[car_at(1, 50.0, 95.0)], DIMS, 0.1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].direction, Direction::Forward);

        // staying at or below the line fires nothing
        let mut counter = LineCounter::new(test_config());
        counter.update(&[car_at(2, 50.0, 100.0)], DIMS, 0.0);
        let hits = counter.update(&[car_at(2, 50.0, 105.0)], DIMS, 0.1);
        assert!(hits.is_empty());
    }

    #[test]
    fn midpoint_overrides_direction_by_lane() {
        let mut config = test_config();
        config.x_mid_ratio = Some(0.10); // x_mid = 100
        let mut counter = LineCounter::new(config);

        // crossing upward left of the midpoint: Forward
        counter.update(&[car_at(1, 50.0, 120.0)], DIMS, 0.0);
        let hits = counter.update(&[car_at(1, 50.0, 90.0)], DIMS, 0.1);
        assert_eq!(hits[0].direction, Direction::Forward);

        // same upward motion right of the midpoint: Return
        let mut config = test_config();
        config.x_mid_ratio = Some(0.10);
        let mut counter = LineCounter::new(config);
        counter.update(&[car_at(2, 150.0, 120.0)], DIMS, 0.0);
        let hits = counter.update(&[car_at(2, 150.0, 90.0)], DIMS, 0.1);
        assert_eq!(hits[0].direction, Direction::Return);
    }

    #[test]
    fn invert_swaps_directions() {
        let mut config = test_config();
        config.invert_direction = true;
        let mut counter = LineCounter::new(config);

        counter.update(&[car_at(1, 50.0, 120.0)], DIMS, 0.0);
        let hits = counter.update(&[car_at(1, 50.0, 90.0)], DIMS, 0.1);
        assert_eq!(hits[0].direction, Direction::Return);
    }

    #[test]
    fn stale_tracks_are_retired() {
        let mut counter = LineCounter::new(test_config());
        counter.update(&[car_at(1, 50.0, 120.0)], DIMS, 0.0);
        assert_eq!(counter.tracked(), 1);

        counter.retire_stale(1.0);
        assert_eq!(counter.tracked(), 1);

        counter.retire_stale(3.0);
        assert_eq!(counter.tracked(), 0);
    }

    #[test]
    fn unknown_class_still_produces_a_hit_marked_undefined() {
        let mut counter = LineCounter::new(test_config());
        let mut t = car_at(9, 50.0, 120.0);
        t.class_name = "bicycle".to_string();
        counter.update(std::slice::from_ref(&t), DIMS, 0.0);
        t.bbox = BBox::new(40.0, 80.0, 60.0, 100.0);
        let hits = counter.update(&[t], DIMS, 0.1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].category, Category::Undefined);
    }
}
