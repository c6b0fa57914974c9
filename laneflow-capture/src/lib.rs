//! Resilient RTSP capture.
//!
//! [`BufferedCapture`] decouples the blocking decode call from the pipeline:
//! a dedicated reader thread pulls frames from a [`CaptureBackend`] through
//! short-lived watchdog threads and pushes them into a small drop-oldest
//! ring, so `read()` always sees the most recent frame with bounded age and
//! a stalled stream is detected as a freeze rather than a hang.
//!
//! The decode handle (an ffmpeg child process in the shipped backend) is
//! only ever touched by the watchdog threads, serialized by a mutex, and is
//! released strictly after the last in-flight read has returned.

use std::time::Duration;

pub mod backend;
pub mod buffered;
pub mod frame;
pub mod stop;

pub use backend::{CaptureBackend, CaptureOptions, FfmpegBackend, ScriptedBackend, ScriptStep};
pub use buffered::BufferedCapture;
pub use frame::{apply_roi_crop, is_frame_valid, roi_rect, Frame};
pub use stop::StopSignal;

/// No new decoded frame for this long means the stream is frozen.
pub const FREEZE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on how long one blocking backend read may stall the reader
/// loop. The native call itself is not interrupted, only abandoned.
pub const READ_WATCHDOG: Duration = Duration::from_secs(6);

/// How long `read()` waits on the frame ring before falling back.
pub const READ_WAIT: Duration = Duration::from_secs(1);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("ffprobe reported no video stream for {url}")]
    NoVideoStream { url: String },
    #[error("could not parse ffprobe output: {source}")]
    ProbeParse {
        #[from]
        source: serde_json::Error,
    },
    #[error("ffprobe failed with status {status}")]
    ProbeFailed { status: std::process::ExitStatus },
    #[error("stream geometry {width}x{height} is not usable")]
    BadGeometry { width: u32, height: u32 },
    #[error("end of stream")]
    EndOfStream,
    #[error("capture backend already released")]
    BackendClosed,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why `BufferedCapture::read()` could not return a frame.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// Frames were flowing and then stopped for longer than
    /// [`FREEZE_TIMEOUT`]. Fatal for this capture instance.
    #[error("capture frozen: no new frame within freeze timeout")]
    Frozen,
    /// The reader has not produced anything yet.
    #[error("no frame data available yet")]
    NoData,
}
