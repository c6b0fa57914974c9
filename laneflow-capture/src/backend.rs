//! Capture backends: the blocking decode seam behind [`BufferedCapture`].
//!
//! The shipped backend spawns an `ffmpeg` child decoding the RTSP stream to
//! raw rgb24 on a pipe; the child process is the "native handle" whose
//! release must be ordered after the last read. [`ScriptedBackend`] replays
//! canned frames for tests and offline runs.

use std::collections::VecDeque;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::frame::Frame;
use crate::{Error, Result};

/// Effective RTSP open options.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Prefer TCP transport over UDP.
    pub prefer_tcp: bool,
    /// Socket receive timeout.
    pub receive_timeout: Duration,
    /// Enable low-delay decoding flags.
    pub low_delay: bool,
    /// Drop corrupted packets instead of emitting broken frames.
    pub discard_corrupt: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            prefer_tcp: true,
            receive_timeout: Duration::from_secs(5),
            low_delay: true,
            discard_corrupt: true,
        }
    }
}

/// A blocking source of decoded frames.
///
/// `read_frame` may block for the full network timeout of the underlying
/// implementation; [`BufferedCapture`](crate::BufferedCapture) isolates it on
/// watchdogged threads. `release` tears the native resource down and must
/// only be called once no read is in flight.
pub trait CaptureBackend: Send {
    fn read_frame(&mut self) -> Result<Frame>;
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn release(&mut self);
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
}

/// Decoding backend on top of an `ffmpeg` subprocess.
pub struct FfmpegBackend {
    child: Option<Child>,
    stdout: Option<std::process::ChildStdout>,
    width: u32,
    height: u32,
    fno: usize,
}

impl FfmpegBackend {
    /// Probe the stream geometry, then start the decode child.
    pub fn open(url: &str, opts: &CaptureOptions) -> Result<Self> {
        let (width, height) = Self::probe(url, opts)?;
        if width < 2 || height < 2 {
            return Err(Error::BadGeometry { width, height });
        }

        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-nostdin", "-loglevel", "error"]);
        Self::push_input_options(&mut cmd, opts);
        cmd.args(["-i", url, "-an", "-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            // the decoder is chatty on broken streams; route its noise away
            // instead of juggling fd 2 in-process
            .stderr(Stdio::null());

        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take();
        debug!("ffmpeg decode child started for {url} at {width}x{height}");
        Ok(Self {
            child: Some(child),
            stdout,
            width,
            height,
            fno: 0,
        })
    }

    fn push_input_options(cmd: &mut Command, opts: &CaptureOptions) {
        if opts.prefer_tcp {
            cmd.args(["-rtsp_transport", "tcp"]);
        }
        let micros = opts.receive_timeout.as_micros().to_string();
        cmd.args(["-stimeout", &micros]);
        if opts.low_delay {
            cmd.args(["-flags", "low_delay"]);
        }
        let mut fflags = String::from("nobuffer");
        if opts.discard_corrupt {
            fflags.push_str("+discardcorrupt");
        }
        cmd.args(["-fflags", &fflags]);
    }

    fn probe(url: &str, opts: &CaptureOptions) -> Result<(u32, u32)> {
        let mut cmd = Command::new("ffprobe");
        cmd.args(["-hide_banner", "-loglevel", "error"]);
        if opts.prefer_tcp {
            cmd.args(["-rtsp_transport", "tcp"]);
        }
        cmd.args([
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height",
            "-of",
            "json",
            url,
        ])
        .stdin(Stdio::null())
        .stderr(Stdio::null());

        let output = cmd.output()?;
        if !output.status.success() {
            return Err(Error::ProbeFailed {
                status: output.status,
            });
        }
        let parsed: ProbeOutput = serde_json::from_slice(&output.stdout)?;
        let stream = parsed
            .streams
            .first()
            .and_then(|s| Some((s.width?, s.height?)))
            .ok_or_else(|| Error::NoVideoStream {
                url: url.to_string(),
            })?;
        Ok(stream)
    }

    fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

impl CaptureBackend for FfmpegBackend {
    fn read_frame(&mut self) -> Result<Frame> {
        let len = self.frame_len();
        let stdout = self.stdout.as_mut().ok_or(Error::BackendClosed)?;
        let mut data = vec![0u8; len];
        stdout.read_exact(&mut data).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::EndOfStream
            } else {
                Error::Io { source: e }
            }
        })?;
        self.fno += 1;
        Frame::new(self.width, self.height, data, self.fno, Utc::now()).ok_or(Error::EndOfStream)
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn release(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!("ffmpeg child kill: {e}");
            }
            match child.wait() {
                Ok(status) => debug!("ffmpeg child exited: {status}"),
                Err(e) => warn!("could not reap ffmpeg child: {e}"),
            }
        }
    }
}

impl Drop for FfmpegBackend {
    fn drop(&mut self) {
        self.release();
    }
}

/// One step of a [`ScriptedBackend`] replay.
pub enum ScriptStep {
    /// Block for `after`, then deliver the frame.
    Frame { after: Duration, frame: Frame },
    /// Block without producing anything (simulates a stalled stream).
    Stall(Duration),
    /// End of stream from here on.
    End,
}

/// Deterministic backend replaying a canned step list.
///
/// This is both the test double for [`BufferedCapture`](crate::BufferedCapture)
/// and a convenient offline source.
pub struct ScriptedBackend {
    steps: VecDeque<ScriptStep>,
    width: u32,
    height: u32,
}

impl ScriptedBackend {
    pub fn new(width: u32, height: u32, steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: steps.into(),
            width,
            height,
        }
    }

    /// A script that delivers `n` black frames spaced `interval` apart.
    pub fn frames_at_interval(width: u32, height: u32, n: usize, interval: Duration) -> Self {
        let steps = (0..n)
            .map(|i| {
                let mut frame = Frame::zeros(width, height);
                frame.fno = i + 1;
                ScriptStep::Frame {
                    after: interval,
                    frame,
                }
            })
            .collect();
        Self::new(width, height, steps)
    }
}

impl CaptureBackend for ScriptedBackend {
    fn read_frame(&mut self) -> Result<Frame> {
        loop {
            match self.steps.pop_front() {
                Some(ScriptStep::Frame { after, frame }) => {
                    std::thread::sleep(after);
                    return Ok(frame);
                }
                Some(ScriptStep::Stall(d)) => {
                    std::thread::sleep(d);
                }
                Some(ScriptStep::End) | None => return Err(Error::EndOfStream),
            }
        }
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn release(&mut self) {
        self.steps.clear();
    }
}
