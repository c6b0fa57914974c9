//! The per-camera pipeline supervisor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use laneflow_capture::{
    apply_roi_crop, is_frame_valid, BufferedCapture, Frame, ReadError, StopSignal,
};
use laneflow_config::{AppConfig, CountingMode};
use laneflow_count::{CounterTally, LineCounter, ZoneCounter};
use laneflow_detect::{DetectorFactory, DetectorOptions, VehicleDetector};
use laneflow_queue::{QueueManager, QueueStats};
use laneflow_scene::{BoxDisplay, CountingOverlay, QueueOverlay, SceneComposer, VisualToggles};
use laneflow_store::{CounterStore, QueueStore};
use laneflow_types::{timestamp, CountersSnapshot, Direction, TRACK_TTL};

/// Counter snapshots are written at most this often per camera.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5);
/// Consecutive empty reads before the connection is declared dead.
const NODATA_LIMIT: u32 = 10;

/// Factory producing a ready capture for the given URL.
pub type CaptureFactory =
    Box<dyn Fn(&str, StopSignal) -> Result<BufferedCapture, laneflow_capture::Error> + Send>;

/// What the pipeline reports while (re)connecting and running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    Online,
    Reconnecting,
    Offline,
    ModelError,
    Stopped,
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            PipelineStatus::Online => "Online",
            PipelineStatus::Reconnecting => "Reconnecting",
            PipelineStatus::Offline => "Offline",
            PipelineStatus::ModelError => "Error: Model",
            PipelineStatus::Stopped => "Stopped",
        };
        write!(f, "{s}")
    }
}

/// Everything the pipeline pushes out, by value.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// The composed, annotated frame.
    Frame(Frame),
    Counters(CountersSnapshot),
    QueueStats(QueueStats),
    Status(PipelineStatus),
    Log(String),
    Fps(f32),
}

/// Retry schedule after a lost stream: a few fast attempts, then patient
/// ones forever.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub fast_retries: u32,
    pub fast_delay: Duration,
    pub slow_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            fast_retries: 5,
            fast_delay: Duration::from_secs(5),
            slow_delay: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (1-based) and the status to
    /// show while waiting.
    pub fn schedule(&self, attempt: u32) -> (Duration, PipelineStatus) {
        if attempt <= self.fast_retries {
            (self.fast_delay, PipelineStatus::Reconnecting)
        } else {
            (self.slow_delay, PipelineStatus::Offline)
        }
    }
}

/// The durable stores, if they could be opened. A missing store degrades
/// the pipeline to in-memory counters instead of failing it.
#[derive(Clone, Default)]
pub struct PipelineStores {
    pub counters: Option<Arc<CounterStore>>,
    pub queue: Option<Arc<QueueStore>>,
}

/// Construction seams: how to open a capture and load a detector.
pub struct PipelineHandles {
    pub capture_factory: CaptureFactory,
    pub detector_factory: DetectorFactory,
    pub reconnect: ReconnectPolicy,
}

struct SharedState {
    monitoring_active: AtomicBool,
    queue_active: AtomicBool,
    visuals: Mutex<VisualToggles>,
}

/// Owns the pipeline thread for one camera.
pub struct PipelineSupervisor {
    stop: StopSignal,
    thread: Option<JoinHandle<()>>,
    shared: Arc<SharedState>,
}

impl PipelineSupervisor {
    /// Spawn the pipeline thread. Events arrive on the returned channel;
    /// the channel disconnects once the pipeline has fully wound down.
    pub fn start(
        config: AppConfig,
        stores: PipelineStores,
        handles: PipelineHandles,
    ) -> (Self, Receiver<PipelineEvent>) {
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let stop = StopSignal::new();
        let shared = Arc::new(SharedState {
            monitoring_active: AtomicBool::new(true),
            queue_active: AtomicBool::new(config.queue_config.enabled),
            visuals: Mutex::new(VisualToggles {
                show_labels: config.show_labels,
                show_zone_tags: config.show_zone_tags,
                hide_detection_lines: config.hide_detection_lines,
                hide_detection_boxes: config.hide_detection_boxes,
            }),
        });

        let worker_stop = stop.clone();
        let worker_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("laneflow-pipeline".to_string())
            .spawn(move || {
                Worker::new(config, stores, handles, worker_shared, worker_stop, event_tx).run();
            })
            .ok();
        if thread.is_none() {
            error!("could not spawn pipeline thread");
        }

        (
            Self {
                stop,
                thread,
                shared,
            },
            event_rx,
        )
    }

    pub fn set_monitoring_active(&self, active: bool) {
        self.shared.monitoring_active.store(active, Ordering::SeqCst);
    }

    pub fn set_queue_active(&self, active: bool) {
        self.shared.queue_active.store(active, Ordering::SeqCst);
    }

    pub fn set_visuals(&self, visuals: VisualToggles) {
        *self.shared.visuals.lock().unwrap_or_else(|e| e.into_inner()) = visuals;
    }

    /// Signal stop and return promptly. The pipeline thread finishes its
    /// shutdown (final snapshot, capture release) in the background; a
    /// detached finalizer reaps it.
    pub fn stop(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.thread.take() {
            let spawned = std::thread::Builder::new()
                .name("laneflow-finalizer".to_string())
                .spawn(move || {
                    if handle.join().is_err() {
                        error!("pipeline thread panicked");
                    }
                });
            if spawned.is_err() {
                warn!("could not spawn finalizer; pipeline thread left detached");
            }
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_stopped()
    }
}

impl Drop for PipelineSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone)]
struct EventTx(Sender<PipelineEvent>);

impl EventTx {
    fn send(&self, event: PipelineEvent) {
        let _ = self.0.send(event);
    }
    fn status(&self, status: PipelineStatus) {
        self.send(PipelineEvent::Status(status));
    }
    fn log(&self, message: String) {
        self.send(PipelineEvent::Log(message));
    }
}

enum LoopExit {
    Stopped,
    StreamDead,
}

struct Worker {
    config: AppConfig,
    stores: PipelineStores,
    handles: PipelineHandles,
    shared: Arc<SharedState>,
    stop: StopSignal,
    events: EventTx,

    tally: CounterTally,
    counters_dirty: bool,
    last_snapshot_save: Instant,
    line_counter: LineCounter,
    zone_counter: ZoneCounter,
    queue_manager: QueueManager,
    composer: SceneComposer,
    /// Direction each track was last counted in, for box coloring.
    track_directions: HashMap<i64, (Direction, f64)>,

    fps_frames: u32,
    fps_window_start: Instant,
}

impl Worker {
    fn new(
        config: AppConfig,
        stores: PipelineStores,
        handles: PipelineHandles,
        shared: Arc<SharedState>,
        stop: StopSignal,
        event_tx: Sender<PipelineEvent>,
    ) -> Self {
        let visuals = *shared.visuals.lock().unwrap_or_else(|e| e.into_inner());
        let line_counter = LineCounter::new(config.line_config.clone());
        let zone_counter = ZoneCounter::new(
            config.zones_config.clone(),
            config.zones_direction,
            config.zone_event_cooldown,
        );
        let queue_manager = QueueManager::new(config.queue_config.clone());
        Self {
            config,
            stores,
            handles,
            shared,
            stop,
            events: EventTx(event_tx),
            tally: CounterTally::new(),
            counters_dirty: false,
            last_snapshot_save: Instant::now(),
            line_counter,
            zone_counter,
            queue_manager,
            composer: SceneComposer::new(visuals),
            track_directions: HashMap::new(),
            fps_frames: 0,
            fps_window_start: Instant::now(),
        }
    }

    fn run(mut self) {
        let url = self.config.rtsp_url.clone();
        if url.is_empty() {
            self.events.log("no rtsp_url configured".to_string());
            self.events.status(PipelineStatus::Stopped);
            return;
        }

        let detector_options = DetectorOptions {
            model: self.config.model.clone(),
            tracker: self.config.tracker.clone(),
            min_confidence: self.config.confidence_min,
        };
        let mut detector = match (self.handles.detector_factory)(&detector_options) {
            Ok(d) => d,
            Err(e) => {
                error!("detector load failed: {e}");
                self.events.log(format!("detector load failed: {e}"));
                self.events.status(PipelineStatus::ModelError);
                return;
            }
        };

        // resume the per-camera counters from storage
        if let Some(store) = &self.stores.counters {
            match store.load_snapshot(&url) {
                Ok(snapshot) => self.tally = CounterTally::from_snapshot(snapshot),
                Err(e) => warn!("could not load stored counters: {e}"),
            }
        }
        self.events.send(PipelineEvent::Counters(self.tally.snapshot()));

        let mut attempt: u32 = 0;
        while !self.stop.is_stopped() {
            match (self.handles.capture_factory)(&url, self.stop.clone()) {
                Ok(capture) => {
                    attempt = 0;
                    info!("stream online: {url}");
                    self.events.status(PipelineStatus::Online);
                    let exit = self.frame_loop(&capture, &mut detector);

                    // release the capture off-thread: the native read may
                    // still be in flight and close() waits for it
                    spawn_capture_finalizer(capture);

                    if matches!(exit, LoopExit::Stopped) {
                        break;
                    }
                }
                Err(e) => {
                    warn!("connect to {url} failed: {e}");
                    self.events.log(format!("connection failed: {e}"));
                }
            }

            attempt += 1;
            let (delay, status) = self.handles.reconnect.schedule(attempt);
            self.events.status(status);
            if self.stop.wait_timeout(delay) {
                break;
            }
        }

        self.persist_final_state(&url);
        self.events.status(PipelineStatus::Stopped);
        debug!("pipeline for {url} finished");
    }

    fn frame_loop(
        &mut self,
        capture: &BufferedCapture,
        detector: &mut Box<dyn VehicleDetector>,
    ) -> LoopExit {
        let mut nodata_count: u32 = 0;
        loop {
            if self.stop.is_stopped() {
                return LoopExit::Stopped;
            }
            let frame = match capture.read() {
                Ok((frame, _age)) => {
                    nodata_count = 0;
                    frame
                }
                Err(ReadError::Frozen) => {
                    warn!("stream frozen, reconnecting");
                    self.events.log("stream frozen, reconnecting".to_string());
                    return LoopExit::StreamDead;
                }
                Err(ReadError::NoData) => {
                    nodata_count += 1;
                    if nodata_count >= NODATA_LIMIT {
                        self.events.log("no stream data, reconnecting".to_string());
                        return LoopExit::StreamDead;
                    }
                    continue;
                }
            };
            self.process_frame(frame, detector);
        }
    }

    fn process_frame(&mut self, frame: Frame, detector: &mut Box<dyn VehicleDetector>) {
        let now = timestamp::epoch_now();
        let url = self.config.rtsp_url.clone();
        let monitoring = self.shared.monitoring_active.load(Ordering::SeqCst);
        let queue_on = self.shared.queue_active.load(Ordering::SeqCst);

        let mut processed = if self.config.use_roi_crop {
            apply_roi_crop(&frame, &self.config.roi_crop)
        } else {
            frame
        };
        if self.config.rtsp_enable_frame_validation && !is_frame_valid(&processed) {
            return;
        }
        let dims = processed.dims();

        let tracks = if monitoring || queue_on {
            match detector.detect(&processed) {
                Ok(tracks) => tracks,
                Err(e) => {
                    warn!("inference error, skipping frame: {e}");
                    return;
                }
            }
        } else {
            Vec::new()
        };

        if monitoring {
            let hits = match self.config.counting_mode {
                CountingMode::Line => self.line_counter.update(&tracks, dims, now),
                CountingMode::Zone => self.zone_counter.update(&tracks, dims, now),
            };
            for hit in &hits {
                if !self.tally.apply(hit) {
                    continue;
                }
                self.counters_dirty = true;
                self.track_directions
                    .insert(hit.track_id, (hit.direction, now));
                self.events.log(format!(
                    "counted {} ({})",
                    hit.category.label(),
                    hit.direction.wire_name()
                ));
                if let Some(store) = &self.stores.counters {
                    if let Err(e) = store.append_event(&url, hit.category, hit.direction) {
                        warn!("count event not persisted: {e}");
                    }
                }
            }
            if !hits.is_empty() {
                self.events
                    .send(PipelineEvent::Counters(self.tally.snapshot()));
            }
        }

        if queue_on {
            let finished = self.queue_manager.update(&tracks, dims, now);
            for event in &finished {
                self.events.log(format!(
                    "queue: track {} waited {:.1}s",
                    event.track_id, event.wait_seconds
                ));
                if let Some(store) = &self.stores.queue {
                    if let Err(e) = store.save_event(event, &url) {
                        warn!("queue event not persisted: {e}");
                    }
                }
            }
            self.events
                .send(PipelineEvent::QueueStats(self.queue_manager.stats(now)));
        }

        // transient per-track state expires with the track
        self.line_counter.retire_stale(now);
        self.zone_counter.retire_stale(now);
        self.track_directions
            .retain(|_, (_, seen)| now - *seen <= TRACK_TTL);

        self.compose_and_emit(&mut processed, &tracks, monitoring, queue_on);
        self.maybe_save_snapshot(&url);
        self.tick_fps();
    }

    fn compose_and_emit(
        &mut self,
        frame: &mut Frame,
        tracks: &[laneflow_types::Track],
        monitoring: bool,
        queue_on: bool,
    ) {
        let visuals = *self.shared.visuals.lock().unwrap_or_else(|e| e.into_inner());
        self.composer.set_toggles(visuals);

        let boxes: Vec<BoxDisplay> = tracks
            .iter()
            .map(|t| BoxDisplay {
                bbox: t.bbox,
                label: format!("{} {}", t.id, t.class_name),
                direction: self.track_directions.get(&t.id).map(|(d, _)| *d),
            })
            .collect();

        let counting_overlay = if monitoring {
            Some(match self.config.counting_mode {
                CountingMode::Line => CountingOverlay::Line(&self.config.line_config),
                CountingMode::Zone => CountingOverlay::Zones(&self.config.zones_config),
            })
        } else {
            None
        };

        let queue_render = if queue_on {
            Some(self.queue_manager.render_data())
        } else {
            None
        };
        let queue_overlay = queue_render.as_ref().map(|render| QueueOverlay {
            render,
            show_timers: self.config.queue_config.show_timers,
            show_trail: self.config.queue_config.show_trail,
            threshold_seconds: self.config.queue_config.threshold_seconds,
        });

        self.composer
            .compose(frame, &boxes, counting_overlay, queue_overlay);
        self.events.send(PipelineEvent::Frame(frame.clone()));
    }

    fn maybe_save_snapshot(&mut self, url: &str) {
        if !self.counters_dirty || self.last_snapshot_save.elapsed() < SNAPSHOT_INTERVAL {
            return;
        }
        if let Some(store) = &self.stores.counters {
            match store.save_snapshot(url, &self.tally.snapshot()) {
                Ok(()) => {
                    self.counters_dirty = false;
                    self.last_snapshot_save = Instant::now();
                }
                Err(e) => {
                    // memory is the source of truth; the next successful
                    // save converges
                    warn!("snapshot save failed: {e}");
                }
            }
        } else {
            self.counters_dirty = false;
        }
    }

    fn persist_final_state(&mut self, url: &str) {
        if let Some(store) = &self.stores.counters {
            if self.counters_dirty {
                if let Err(e) = store.save_snapshot(url, &self.tally.snapshot()) {
                    warn!("final snapshot save failed: {e}");
                }
            }
            if let Err(e) = store.flush() {
                warn!("counter store flush failed: {e}");
            }
        }
    }

    fn tick_fps(&mut self) {
        self.fps_frames += 1;
        let elapsed = self.fps_window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            let fps = self.fps_frames as f32 / elapsed.as_secs_f32();
            self.events.send(PipelineEvent::Fps(fps));
            self.fps_frames = 0;
            self.fps_window_start = Instant::now();
        }
    }
}

fn spawn_capture_finalizer(capture: BufferedCapture) {
    // dropping the capture on spawn failure still signals its reader to
    // stop; only the eager close is lost
    if let Err(e) = std::thread::Builder::new()
        .name("laneflow-capture-finalizer".to_string())
        .spawn(move || capture.close())
    {
        warn!("could not spawn capture finalizer: {e}");
    }
}
