//! Core data model for the laneflow traffic-metrics pipeline.
//!
//! Everything here is plain data shared between the capture, counting, queue
//! and storage crates: vehicle categories with their stable storage ids,
//! counting directions, tracks as emitted by the detector, counter snapshots
//! and the immutable event records that get persisted.

use serde::{Deserialize, Serialize};

pub mod geometry;
pub mod timestamp;

pub use geometry::{LineConfig, QueueConfig, RoiCrop, ZoneDirections, ZonesConfig};

/// Seconds a track may go unseen before its transient state is dropped.
pub const TRACK_TTL: f64 = 2.0;

/// Vehicle category with a stable integer id used in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    Undefined,
    Cars,
    Motos,
    Trucks,
    Buses,
}

/// The categories that actually accumulate counts (everything but
/// [Category::Undefined]).
pub const COUNTED_CATEGORIES: [Category; 4] = [
    Category::Cars,
    Category::Motos,
    Category::Trucks,
    Category::Buses,
];

impl Category {
    /// Map a detector class name onto a category.
    ///
    /// The mapping is fixed: `car`, the three motorcycle synonyms emitted by
    /// different datasets (`motorcycle`, `moto`, `motor`), `truck` and `bus`.
    /// Any other class name is `Undefined` and is not counted.
    pub fn from_class_name(name: &str) -> Category {
        match name {
            "car" => Category::Cars,
            "motorcycle" | "moto" | "motor" => Category::Motos,
            "truck" => Category::Trucks,
            "bus" => Category::Buses,
            _ => Category::Undefined,
        }
    }

    pub fn as_id(&self) -> i64 {
        match self {
            Category::Undefined => 0,
            Category::Cars => 1,
            Category::Motos => 2,
            Category::Trucks => 3,
            Category::Buses => 4,
        }
    }

    pub fn from_id(id: i64) -> Category {
        match id {
            1 => Category::Cars,
            2 => Category::Motos,
            3 => Category::Trucks,
            4 => Category::Buses,
            _ => Category::Undefined,
        }
    }

    /// Human-readable label, also used for the denormalized counter rows.
    pub fn label(&self) -> &'static str {
        match self {
            Category::Undefined => "Undefined",
            Category::Cars => "Cars",
            Category::Motos => "Motos",
            Category::Trucks => "Trucks",
            Category::Buses => "Buses",
        }
    }

    /// Inverse of [Category::label]; unknown labels are `Undefined`.
    pub fn from_label(label: &str) -> Category {
        match label {
            "Cars" => Category::Cars,
            "Motos" => Category::Motos,
            "Trucks" => Category::Trucks,
            "Buses" => Category::Buses,
            _ => Category::Undefined,
        }
    }
}

/// Counting direction. The wire names (`ida`/`volta`) are kept for
/// compatibility with the stored data and the configuration documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "indefinido")]
    Undefined,
    #[serde(rename = "ida")]
    Forward,
    #[serde(rename = "volta")]
    Return,
}

pub const COUNTED_DIRECTIONS: [Direction; 2] = [Direction::Forward, Direction::Return];

impl Direction {
    pub fn as_id(&self) -> i64 {
        match self {
            Direction::Undefined => 0,
            Direction::Forward => 1,
            Direction::Return => 2,
        }
    }

    pub fn from_id(id: i64) -> Direction {
        match id {
            1 => Direction::Forward,
            2 => Direction::Return,
            _ => Direction::Undefined,
        }
    }

    pub fn wire_name(&self) -> &'static str {
        match self {
            Direction::Undefined => "indefinido",
            Direction::Forward => "ida",
            Direction::Return => "volta",
        }
    }

    pub fn from_wire_name(name: &str) -> Direction {
        match name {
            "ida" => Direction::Forward,
            "volta" => Direction::Return,
            _ => Direction::Undefined,
        }
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Forward => Direction::Return,
            Direction::Return => Direction::Forward,
            Direction::Undefined => Direction::Undefined,
        }
    }
}

/// Which crossing directions a counting line accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DirectionMode {
    #[default]
    #[serde(rename = "both")]
    Both,
    #[serde(rename = "ida_only")]
    ForwardOnly,
    #[serde(rename = "volta_only")]
    ReturnOnly,
}

impl DirectionMode {
    pub fn accepts(&self, direction: Direction) -> bool {
        match self {
            DirectionMode::Both => true,
            DirectionMode::ForwardOnly => direction == Direction::Forward,
            DirectionMode::ReturnOnly => direction == Direction::Return,
        }
    }
}

/// Axis-aligned bounding box in processed-frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Bottom-center of the box, the point where the vehicle touches the
    /// ground. Queue membership is decided on this point.
    pub fn foot(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, self.y2)
    }
}

/// One tracked object as reported by the detector for one frame.
///
/// Track ids are stable while the object stays visible; a vehicle that leaves
/// the frame and comes back may get a new id.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub id: i64,
    pub bbox: BBox,
    pub class_name: String,
    pub confidence: f32,
}

impl Track {
    pub fn category(&self) -> Category {
        Category::from_class_name(&self.class_name)
    }
}

/// Immutable record of one counted vehicle, as persisted in history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountEvent {
    pub camera_id: i64,
    /// Unix epoch seconds.
    pub timestamp: i64,
    pub category: Category,
    pub direction: Direction,
}

/// A completed queue wait, emitted once a vehicle leaves the queue polygon
/// having waited at least the configured minimum.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEvent {
    pub track_id: i64,
    /// Epoch seconds when the vehicle entered the polygon.
    pub entry: f64,
    /// Epoch seconds when the wait was finalized.
    pub exit: f64,
    pub wait_seconds: f64,
    pub vehicle_class: String,
}

impl QueueEvent {
    pub fn entry_string(&self) -> String {
        timestamp::format_epoch_local(self.entry)
    }

    pub fn exit_string(&self) -> String {
        timestamp::format_epoch_local(self.exit)
    }
}

/// Per-camera counter table: one cell per (category, direction), with the
/// directional totals computed on demand.
///
/// This is the single source of truth on reload: persisting a snapshot and
/// loading it back reproduces the same table exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CountersSnapshot {
    counts: [[u64; 2]; 4],
}

fn cat_index(category: Category) -> Option<usize> {
    match category {
        Category::Cars => Some(0),
        Category::Motos => Some(1),
        Category::Trucks => Some(2),
        Category::Buses => Some(3),
        Category::Undefined => None,
    }
}

fn dir_index(direction: Direction) -> Option<usize> {
    match direction {
        Direction::Forward => Some(0),
        Direction::Return => Some(1),
        Direction::Undefined => None,
    }
}

impl CountersSnapshot {
    pub fn get(&self, category: Category, direction: Direction) -> u64 {
        match (cat_index(category), dir_index(direction)) {
            (Some(c), Some(d)) => self.counts[c][d],
            _ => 0,
        }
    }

    pub fn set(&mut self, category: Category, direction: Direction, value: u64) {
        if let (Some(c), Some(d)) = (cat_index(category), dir_index(direction)) {
            self.counts[c][d] = value;
        }
    }

    /// Increment one cell. Undefined categories and directions are ignored;
    /// the caller is expected to have warned about them already.
    pub fn add(&mut self, category: Category, direction: Direction) {
        if let (Some(c), Some(d)) = (cat_index(category), dir_index(direction)) {
            self.counts[c][d] += 1;
        }
    }

    /// Virtual `total` aggregate: the sum over all categories for one
    /// direction.
    pub fn total(&self, direction: Direction) -> u64 {
        COUNTED_CATEGORIES
            .iter()
            .map(|c| self.get(*c, direction))
            .sum()
    }

    pub fn grand_total(&self) -> u64 {
        self.total(Direction::Forward) + self.total(Direction::Return)
    }

    /// Iterate all concrete (category, direction, value) cells, totals
    /// excluded.
    pub fn iter(&self) -> impl Iterator<Item = (Category, Direction, u64)> + '_ {
        COUNTED_CATEGORIES.iter().flat_map(move |cat| {
            COUNTED_DIRECTIONS
                .iter()
                .map(move |dir| (*cat, *dir, self.get(*cat, *dir)))
        })
    }
}
