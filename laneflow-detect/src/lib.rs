//! Detector/tracker interface.
//!
//! The actual neural detector and multi-object tracker live outside this
//! workspace; this crate defines the seam they plug into, mirroring how the
//! capture backends plug into `laneflow-capture`. Implementations consume an
//! RGB frame and return the tracked objects above a confidence floor, with
//! ids that stay stable while an object remains visible.

use std::collections::VecDeque;

use laneflow_capture::Frame;
use laneflow_types::Track;

/// Errors loading a detector backend. Fatal for the pipeline: no frames are
/// processed, but the process stays up for reconfiguration.
#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("model file not found: {path}")]
    ModelNotFound { path: String },
    #[error("unknown tracker backend: {name}")]
    UnknownTracker { name: String },
    #[error("detector backend unusable: {reason}")]
    BackendUnusable { reason: String },
}

/// Transient per-frame inference failure; log and skip the frame.
#[derive(thiserror::Error, Debug)]
#[error("inference failed: {reason}")]
pub struct InferenceError {
    pub reason: String,
}

/// Knobs passed to a detector backend at load time.
#[derive(Debug, Clone)]
pub struct DetectorOptions {
    /// Model identifier, typically a weights file path.
    pub model: String,
    /// Tracker backend identifier.
    pub tracker: String,
    /// Detections below this confidence are dropped.
    pub min_confidence: f32,
}

/// A detector+tracker pair.
///
/// `detect` is called once per processed frame with the (possibly cropped)
/// image and returns the current track list. It may block for the duration
/// of one inference.
pub trait VehicleDetector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Track>, InferenceError>;
}

/// Factory closure the supervisor uses to (re)load the detector.
pub type DetectorFactory =
    Box<dyn Fn(&DetectorOptions) -> Result<Box<dyn VehicleDetector>, LoadError> + Send>;

/// Replays canned per-frame track lists.
///
/// The test double for everything downstream of inference, and a handy
/// source for offline pipeline runs: each `detect` call pops the next frame
/// worth of tracks, applying the same confidence filter a real backend
/// would.
pub struct ScriptedDetector {
    frames: VecDeque<Vec<Track>>,
    min_confidence: f32,
}

impl ScriptedDetector {
    pub fn new(frames: Vec<Vec<Track>>, min_confidence: f32) -> Self {
        Self {
            frames: frames.into(),
            min_confidence,
        }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl VehicleDetector for ScriptedDetector {
    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Track>, InferenceError> {
        let tracks = self.frames.pop_front().unwrap_or_default();
        Ok(tracks
            .into_iter()
            .filter(|t| t.confidence >= self.min_confidence)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use laneflow_types::BBox;

    fn track(id: i64, confidence: f32) -> Track {
        Track {
            id,
            bbox: BBox::new(0.0, 0.0, 10.0, 10.0),
            class_name: "car".to_string(),
            confidence,
        }
    }

    #[test]
    fn scripted_detector_replays_and_filters() {
        let mut det = ScriptedDetector::new(
            vec![vec![track(1, 0.9), track(2, 0.2)], vec![track(1, 0.8)]],
            0.5,
        );
        let frame = Frame::zeros(8, 8);

        let first = det.detect(&frame).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, 1);

        let second = det.detect(&frame).unwrap();
        assert_eq!(second.len(), 1);

        // exhausted: empty track lists from here on
        assert!(det.detect(&frame).unwrap().is_empty());
    }
}
