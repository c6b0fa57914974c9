//! Scene composition: draws boxes, counting geometry, the queue polygon,
//! trails and timers onto the outgoing frame.
//!
//! Stateless apart from the loaded font and the visual toggles; everything
//! else is handed in per frame. The visual output is advisory, not
//! bit-exact.

use rusttype::Font;
use tracing::warn;

use laneflow_capture::Frame;
use laneflow_queue::{QueueRenderData, QueueStatus};
use laneflow_types::{BBox, Direction, DirectionMode, LineConfig, ZonesConfig};

pub mod draw;

use draw::Rgb;

const FORWARD_GREEN: Rgb = [80, 220, 80];
const RETURN_RED: Rgb = [220, 80, 80];
const NEUTRAL_GREEN: Rgb = [0, 200, 80];
const LINE_YELLOW: Rgb = [255, 255, 0];
const MIDPOINT_ORANGE: Rgb = [255, 180, 0];
const DIMMED: Rgb = [120, 120, 120];
const WHITE: Rgb = [255, 255, 255];
const BLACK: Rgb = [0, 0, 0];
const TIMER_ORANGE: Rgb = [255, 165, 0];
const TIMER_RED: Rgb = [255, 0, 0];
const ENTRY_CYAN: Rgb = [0, 255, 255];

const LABEL_SCALE: f32 = 16.0;
const TIMER_SCALE: f32 = 14.0;

/// Display options mirrored from the configuration document.
#[derive(Debug, Clone, Copy, Default)]
pub struct VisualToggles {
    pub show_labels: bool,
    pub show_zone_tags: bool,
    pub hide_detection_lines: bool,
    pub hide_detection_boxes: bool,
}

/// One bounding box ready for drawing: label text plus the direction the
/// track was counted in, if any.
#[derive(Debug, Clone)]
pub struct BoxDisplay {
    pub bbox: BBox,
    pub label: String,
    pub direction: Option<Direction>,
}

/// Counting geometry for the active monitoring mode.
#[derive(Debug, Clone, Copy)]
pub enum CountingOverlay<'a> {
    Line(&'a LineConfig),
    Zones(&'a ZonesConfig),
}

/// Queue drawing inputs for one frame.
#[derive(Debug, Clone, Copy)]
pub struct QueueOverlay<'a> {
    pub render: &'a QueueRenderData,
    pub show_timers: bool,
    pub show_trail: bool,
    pub threshold_seconds: f64,
}

pub struct SceneComposer {
    font: Option<Font<'static>>,
    pub toggles: VisualToggles,
}

impl SceneComposer {
    pub fn new(toggles: VisualToggles) -> Self {
        let font = Font::try_from_bytes(ttf_firacode::REGULAR as &[u8]);
        if font.is_none() {
            warn!("embedded font failed to parse, text overlays disabled");
        }
        Self { font, toggles }
    }

    pub fn set_toggles(&mut self, toggles: VisualToggles) {
        self.toggles = toggles;
    }

    /// Draw everything for one frame: overlays first, boxes and queue
    /// decorations on top.
    pub fn compose(
        &self,
        frame: &mut Frame,
        boxes: &[BoxDisplay],
        counting: Option<CountingOverlay>,
        queue: Option<QueueOverlay>,
    ) {
        if let Some(overlay) = counting {
            if !self.toggles.hide_detection_lines {
                match overlay {
                    CountingOverlay::Line(config) => self.draw_counting_line(frame, config),
                    CountingOverlay::Zones(config) => self.draw_zones(frame, config),
                }
            }
        }
        if let Some(q) = queue {
            self.draw_queue(frame, &q);
        }
        self.draw_boxes(frame, boxes);
    }

    fn draw_boxes(&self, frame: &mut Frame, boxes: &[BoxDisplay]) {
        for b in boxes {
            let color = match b.direction {
                Some(Direction::Forward) => FORWARD_GREEN,
                Some(Direction::Return) => RETURN_RED,
                _ => NEUTRAL_GREEN,
            };
            let p1 = (b.bbox.x1 as i64, b.bbox.y1 as i64);
            let p2 = (b.bbox.x2 as i64, b.bbox.y2 as i64);
            if !self.toggles.hide_detection_boxes {
                draw::draw_rect(frame, p1, p2, color, 2);
            }
            if self.toggles.show_labels {
                if let Some(font) = &self.font {
                    let w = draw::text_width(font, &b.label, LABEL_SCALE);
                    draw::fill_rect(
                        frame,
                        (p1.0, p1.1 - LABEL_SCALE as i64 - 4),
                        (p1.0 + w as i64 + 4, p1.1),
                        color,
                        1.0,
                    );
                    draw::draw_text(
                        frame,
                        font,
                        &b.label,
                        (b.bbox.x1 + 2.0, b.bbox.y1 - 5.0),
                        LABEL_SCALE,
                        WHITE,
                    );
                }
            }
        }
    }

    fn draw_counting_line(&self, frame: &mut Frame, config: &LineConfig) {
        let (w, h) = frame.dims();
        let (w, h) = (w as f32, h as f32);
        let y = (config.y_ratio * h) as i64;
        let x1 = (config.x1_ratio * w) as i64;
        let x2 = (config.x2_ratio * w) as i64;

        match config.x_mid_ratio {
            Some(mid_ratio) => {
                let x_mid = (mid_ratio * w) as i64;
                let (mut left_color, mut right_color) = (FORWARD_GREEN, RETURN_RED);
                let (mut left_label, mut right_label) = ("IDA", "VOLTA");
                if config.invert_direction {
                    std::mem::swap(&mut left_color, &mut right_color);
                    std::mem::swap(&mut left_label, &mut right_label);
                }

                // a filtered-out side is drawn dimmed
                let left_dir = if config.invert_direction {
                    Direction::Return
                } else {
                    Direction::Forward
                };
                let show_left = config.direction_mode.accepts(left_dir);
                let show_right = match config.direction_mode {
                    DirectionMode::Both => true,
                    _ => !show_left,
                };
                let lc = if show_left { left_color } else { DIMMED };
                let rc = if show_right { right_color } else { DIMMED };

                draw::draw_line(frame, (x1, y), (x_mid, y), lc, 2);
                draw::draw_line(frame, (x_mid, y), (x2, y), rc, 2);
                draw::draw_disc(frame, (x1, y), 4, lc);
                draw::draw_disc(frame, (x_mid, y), 5, MIDPOINT_ORANGE);
                draw::draw_disc(frame, (x2, y), 4, rc);

                if let Some(font) = &self.font {
                    if show_left && x_mid > x1 {
                        let lx = (x1 + x_mid) / 2;
                        draw::draw_text(
                            frame,
                            font,
                            left_label,
                            (lx as f32 - 20.0, y as f32 - 8.0),
                            LABEL_SCALE,
                            left_color,
                        );
                    }
                    if show_right && x2 > x_mid {
                        let rx = (x_mid + x2) / 2;
                        draw::draw_text(
                            frame,
                            font,
                            right_label,
                            (rx as f32 - 26.0, y as f32 - 8.0),
                            LABEL_SCALE,
                            right_color,
                        );
                    }
                }
            }
            None => {
                draw::draw_line(frame, (x1, y), (x2, y), LINE_YELLOW, 2);
                draw::draw_disc(frame, (x1, y), 4, LINE_YELLOW);
                draw::draw_disc(frame, (x2, y), 4, LINE_YELLOW);
            }
        }
    }

    fn draw_zones(&self, frame: &mut Frame, config: &ZonesConfig) {
        let (w, h) = frame.dims();
        let (w, h) = (w as f32, h as f32);
        for (rect, color) in [(&config.down, FORWARD_GREEN), (&config.up, RETURN_RED)] {
            let p1 = ((rect[0] * w) as i64, (rect[1] * h) as i64);
            let p2 = ((rect[2] * w) as i64, (rect[3] * h) as i64);
            draw::fill_rect(frame, p1, p2, color, 0.3);
            draw::draw_rect(frame, p1, p2, color, 2);
        }
    }

    fn draw_queue(&self, frame: &mut Frame, overlay: &QueueOverlay) {
        let render = overlay.render;
        let (border, fill) = match render.status {
            Some(QueueStatus::Critical) => ([255, 0, 0], [220, 0, 0]),
            Some(QueueStatus::Warning) => ([255, 140, 0], [200, 120, 0]),
            _ => ([0, 200, 80], [0, 180, 60]),
        };

        if self.toggles.show_zone_tags && render.polygon.len() >= 3 {
            draw::fill_polygon(frame, &render.polygon, fill, 0.2);
            draw::draw_polyline(frame, &render.polygon, true, border, 2);
            if let Some(font) = &self.font {
                // tag near the topmost vertex
                let top = render
                    .polygon
                    .iter()
                    .cloned()
                    .min_by(|a, b| a.1.total_cmp(&b.1))
                    .unwrap_or((0.0, 0.0));
                draw::draw_text(
                    frame,
                    font,
                    "QUEUE ZONE",
                    (top.0, (top.1 - 10.0).max(15.0)),
                    LABEL_SCALE,
                    border,
                );
            }
        }

        if self.toggles.show_zone_tags {
            for (line, color, label) in [
                (render.entry_line, ENTRY_CYAN, "IN"),
                (render.exit_line, TIMER_RED, "OUT"),
            ] {
                if let Some([a, b]) = line {
                    let ai = (a.0 as i64, a.1 as i64);
                    let bi = (b.0 as i64, b.1 as i64);
                    draw::draw_line(frame, ai, bi, color, 2);
                    draw::draw_disc(frame, ai, 5, color);
                    draw::draw_disc(frame, bi, 5, color);
                    if let Some(font) = &self.font {
                        draw::draw_text(
                            frame,
                            font,
                            label,
                            (a.0 + 4.0, a.1 - 8.0),
                            LABEL_SCALE,
                            color,
                        );
                    }
                }
            }
        }

        for vehicle in &render.vehicles {
            if overlay.show_trail && vehicle.trail.len() > 1 {
                draw::draw_polyline(frame, &vehicle.trail, false, border, 1);
            }

            let foot = vehicle.last_pos;
            if overlay.show_timers {
                if let Some(font) = &self.font {
                    let text = timer_text(vehicle.track_id, vehicle.wait);
                    let color = timer_color(vehicle.wait, overlay.threshold_seconds);
                    let tw = draw::text_width(font, &text, TIMER_SCALE);
                    let (cx, cy) = (foot.0 as i64, foot.1 as i64);
                    let half = (tw / 2.0) as i64;
                    draw::fill_rect(
                        frame,
                        (cx - half - 4, cy - TIMER_SCALE as i64 - 18),
                        (cx + half + 4, cy - 10),
                        BLACK,
                        1.0,
                    );
                    draw::draw_rect(
                        frame,
                        (cx - half - 4, cy - TIMER_SCALE as i64 - 18),
                        (cx + half + 4, cy - 10),
                        border,
                        1,
                    );
                    draw::draw_text(
                        frame,
                        font,
                        &text,
                        (foot.0 - tw / 2.0, foot.1 - 14.0),
                        TIMER_SCALE,
                        color,
                    );
                }
            }
            draw::draw_disc(frame, (foot.0 as i64, foot.1 as i64), 4, border);
        }
    }
}

/// `"ID:k  mm:ss"` badge text.
pub fn timer_text(track_id: i64, wait: f64) -> String {
    let total = wait.max(0.0) as u64;
    format!("ID:{}  {:02}:{:02}", track_id, total / 60, total % 60)
}

/// White below half the threshold, orange approaching it, red beyond.
pub fn timer_color(wait: f64, threshold: f64) -> Rgb {
    let ratio = (wait / threshold.max(1.0)).min(1.0);
    if ratio < 0.5 {
        WHITE
    } else if ratio < 1.0 {
        TIMER_ORANGE
    } else {
        TIMER_RED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use laneflow_queue::QueueVehicleRender;

    #[test]
    fn timer_text_formats_minutes_and_seconds() {
        assert_eq!(timer_text(11, 42.4), "ID:11  00:42");
        assert_eq!(timer_text(3, 125.0), "ID:3  02:05");
    }

    #[test]
    fn timer_color_ramps_white_orange_red() {
        assert_eq!(timer_color(10.0, 60.0), WHITE);
        assert_eq!(timer_color(40.0, 60.0), TIMER_ORANGE);
        assert_eq!(timer_color(61.0, 60.0), TIMER_RED);
    }

    #[test]
    fn compose_touches_the_frame() {
        let composer = SceneComposer::new(VisualToggles {
            show_zone_tags: true,
            ..Default::default()
        });
        let mut frame = Frame::zeros(100, 100);
        let boxes = vec![BoxDisplay {
            bbox: BBox::new(10.0, 10.0, 40.0, 40.0),
            label: "7 car".to_string(),
            direction: Some(Direction::Forward),
        }];
        let line = LineConfig::default();
        composer.compose(&mut frame, &boxes, Some(CountingOverlay::Line(&line)), None);
        assert_eq!(frame.pixel(10, 25), FORWARD_GREEN);
    }

    #[test]
    fn hidden_boxes_are_not_drawn() {
        let composer = SceneComposer::new(VisualToggles {
            hide_detection_boxes: true,
            hide_detection_lines: true,
            ..Default::default()
        });
        let mut frame = Frame::zeros(100, 100);
        let boxes = vec![BoxDisplay {
            bbox: BBox::new(10.0, 10.0, 40.0, 40.0),
            label: "x".to_string(),
            direction: None,
        }];
        let line = LineConfig::default();
        composer.compose(&mut frame, &boxes, Some(CountingOverlay::Line(&line)), None);
        assert_eq!(frame.pixel(10, 25), [0, 0, 0]);
    }

    #[test]
    fn queue_overlay_fills_polygon_by_status() {
        let composer = SceneComposer::new(VisualToggles {
            show_zone_tags: true,
            ..Default::default()
        });
        let mut frame = Frame::zeros(100, 100);
        let render = QueueRenderData {
            polygon: vec![(10.0, 50.0), (90.0, 50.0), (90.0, 95.0), (10.0, 95.0)],
            entry_line: None,
            exit_line: None,
            status: Some(QueueStatus::Normal),
            vehicles: vec![QueueVehicleRender {
                track_id: 4,
                wait: 12.0,
                last_pos: (50.0, 80.0),
                trail: vec![(48.0, 78.0), (50.0, 80.0)],
            }],
        };
        let overlay = QueueOverlay {
            render: &render,
            show_timers: false,
            show_trail: true,
            threshold_seconds: 60.0,
        };
        composer.compose(&mut frame, &[], None, Some(overlay));
        // interior got the translucent fill
        assert_ne!(frame.pixel(50, 70), [0, 0, 0]);
        // foot marker
        assert_eq!(frame.pixel(50, 80), [0, 200, 80]);
    }
}
