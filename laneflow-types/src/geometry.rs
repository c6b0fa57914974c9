//! Geometry configuration for counting and queue tracking.
//!
//! All coordinates are ratios in `[0, 1]` normalized to the processed frame
//! (after the optional ROI crop), so a configuration keeps working when the
//! stream resolution changes.

use serde::{Deserialize, Serialize};

use crate::{Direction, DirectionMode};

fn default_x1_ratio() -> f32 {
    0.10
}
fn default_x2_ratio() -> f32 {
    0.90
}
fn default_y_ratio() -> f32 {
    0.55
}
fn default_band_px() -> f32 {
    2.0
}

/// Horizontal counting line, optionally split by a midpoint into two
/// direction lanes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineConfig {
    #[serde(default = "default_x1_ratio")]
    pub x1_ratio: f32,
    #[serde(default = "default_x2_ratio")]
    pub x2_ratio: f32,
    #[serde(default = "default_y_ratio")]
    pub y_ratio: f32,
    /// Crossing band in pixels: both centroids further than this from the
    /// line on the same side short-circuit the intersection test.
    #[serde(default = "default_band_px")]
    pub band_px: f32,
    /// When set, the side of this vertical split decides the direction
    /// instead of the vertical motion.
    #[serde(default)]
    pub x_mid_ratio: Option<f32>,
    #[serde(default)]
    pub invert_direction: bool,
    #[serde(default)]
    pub direction_mode: DirectionMode,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            x1_ratio: default_x1_ratio(),
            x2_ratio: default_x2_ratio(),
            y_ratio: default_y_ratio(),
            band_px: default_band_px(),
            x_mid_ratio: None,
            invert_direction: false,
            direction_mode: DirectionMode::Both,
        }
    }
}

fn default_down_zone() -> [f32; 4] {
    [0.10, 0.60, 0.90, 0.95]
}
fn default_up_zone() -> [f32; 4] {
    [0.10, 0.05, 0.90, 0.40]
}

/// The two counting rectangles, each `[x1, y1, x2, y2]` in ratios.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZonesConfig {
    #[serde(default = "default_down_zone")]
    pub down: [f32; 4],
    #[serde(default = "default_up_zone")]
    pub up: [f32; 4],
}

impl Default for ZonesConfig {
    fn default() -> Self {
        Self {
            down: default_down_zone(),
            up: default_up_zone(),
        }
    }
}

fn default_down_direction() -> Direction {
    Direction::Forward
}
fn default_up_direction() -> Direction {
    Direction::Return
}

/// Which direction each zone counts for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoneDirections {
    #[serde(default = "default_down_direction")]
    pub down: Direction,
    #[serde(default = "default_up_direction")]
    pub up: Direction,
}

impl Default for ZoneDirections {
    fn default() -> Self {
        Self {
            down: default_down_direction(),
            up: default_up_direction(),
        }
    }
}

fn default_threshold_seconds() -> f64 {
    60.0
}
fn default_min_wait_time() -> f64 {
    5.0
}
fn default_true() -> bool {
    true
}

/// Queue area configuration: the polygon, alert thresholds and display
/// options. Entry/exit lines are display-only markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Waits above this are Critical; above half of it, Warning.
    #[serde(default = "default_threshold_seconds")]
    pub threshold_seconds: f64,
    /// Completed waits shorter than this are discarded, not persisted.
    #[serde(default = "default_min_wait_time")]
    pub min_wait_time: f64,
    #[serde(default = "default_true")]
    pub show_timers: bool,
    #[serde(default = "default_true")]
    pub show_trail: bool,
    /// Ordered closed polygon, `[[x, y], ...]` ratios. Fewer than 3 points
    /// disables queue membership entirely.
    #[serde(default)]
    pub polygon: Vec<[f32; 2]>,
    #[serde(default)]
    pub entry_line: Option<[[f32; 2]; 2]>,
    #[serde(default)]
    pub exit_line: Option<[[f32; 2]; 2]>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_seconds: default_threshold_seconds(),
            min_wait_time: default_min_wait_time(),
            show_timers: true,
            show_trail: true,
            polygon: Vec::new(),
            entry_line: None,
            exit_line: None,
        }
    }
}

impl QueueConfig {
    pub fn has_polygon(&self) -> bool {
        self.polygon.len() >= 3
    }
}

/// ROI crop percents, each clamped to `[0, 50]` when applied.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RoiCrop {
    #[serde(default)]
    pub top_percent: f32,
    #[serde(default)]
    pub bottom_percent: f32,
    #[serde(default)]
    pub left_percent: f32,
    #[serde(default)]
    pub right_percent: f32,
}
