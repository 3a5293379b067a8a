//! Frame pipeline: source -> queue -> detection worker -> renderer.
//!
//! [`Pipeline`] is the only place that starts or stops anything. Platform
//! callbacks (camera open, surface resize, device rotation) are expected to be
//! thin adapters calling into it.

pub mod fps;
pub mod queue;
pub mod sink;
pub mod worker;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, instrument, warn};

use crate::capture::FrameSource;
use crate::detect::TagDetector;
use crate::display::{CoordinateMapper, Facing, PresentationSurface, Renderer, Rotation};
use crate::errors::{DetectorError, PipelineError};
use crate::settings::Settings;

pub use fps::FpsMeter;
pub use queue::{Enqueued, FrameQueue, QueueStats, Waited};
pub use sink::FrameSink;
pub use worker::{DetectionWorker, WorkerStats};

use worker::{DetectorSlot, WorkerCommand, WorkerHandle, WorkerSpawn};

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PipelineState {
    Stopped = 0,
    /// Worker is up, waiting for the first frame.
    Starting = 1,
    Running = 2,
    /// Stop requested; the worker is being joined.
    Draining = 3,
}

impl PipelineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PipelineState::Starting,
            2 => PipelineState::Running,
            3 => PipelineState::Draining,
            _ => PipelineState::Stopped,
        }
    }
}

/// State shared with the frame sink, which performs Starting -> Running.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: PipelineState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> PipelineState {
        PipelineState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: PipelineState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move `from -> to` if currently in `from`.
    pub(crate) fn advance(&self, from: PipelineState, to: PipelineState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Notifications for UI adapters. Sends never block; a full channel drops.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PipelineEvent {
    StateChanged(PipelineState),
    /// Frames delivered by the source per second.
    CaptureFps(f64),
    /// Detect + render cycles per second.
    DetectFps(f64),
    /// Frames evicted during the last capture window.
    Backpressure { dropped: u64, total_dropped: u64 },
}

/// Counters accumulated over the lifetime of a pipeline.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub processed: u64,
    pub detector_failures: u64,
    pub rendered: u64,
    pub superseded: u64,
    pub renders_skipped: u64,
}

/// Pieces that only exist between start and stop.
struct Running {
    queue: Arc<FrameQueue>,
    sink: FrameSink,
    worker: WorkerHandle,
    stats: Arc<WorkerStats>,
}

pub struct Pipeline {
    settings: Settings,
    source: Box<dyn FrameSource>,
    detector: DetectorSlot,
    renderer: Arc<Renderer>,
    state: Arc<StateCell>,
    events_tx: flume::Sender<PipelineEvent>,
    events_rx: flume::Receiver<PipelineEvent>,
    running: Option<Running>,
    /// Queue and worker counters from previous runs.
    history: PipelineStats,
}

fn display_rotation(settings: &Settings) -> Rotation {
    Rotation::for_display(
        settings.capture.sensor_orientation,
        settings.display.rotation,
        settings.capture.facing,
    )
}

impl Pipeline {
    /// Assemble a stopped pipeline. The detector is owned by the pipeline
    /// from here on and only ever called from the detection worker.
    pub fn new<S, D, P>(settings: Settings, source: S, detector: D, surface: P) -> Self
    where
        S: FrameSource + 'static,
        D: TagDetector + 'static,
        P: PresentationSurface + 'static,
    {
        let mapper = Arc::new(CoordinateMapper::new(
            display_rotation(&settings),
            settings.capture.facing == Facing::Front,
        ));
        let renderer = Arc::new(Renderer::new(surface, mapper));
        let (events_tx, events_rx) = flume::bounded(settings.pipeline.event_capacity.max(1));
        let detector: Box<dyn TagDetector> = Box::new(detector);

        Self {
            settings,
            source: Box::new(source),
            detector: Arc::new(Mutex::new(Some(detector))),
            renderer,
            state: Arc::new(StateCell::new(PipelineState::Stopped)),
            events_tx,
            events_rx,
            running: None,
            history: PipelineStats::default(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state.get()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Subscribe to pipeline events. All receivers share one bounded channel.
    pub fn events(&self) -> flume::Receiver<PipelineEvent> {
        self.events_rx.clone()
    }

    pub fn renderer(&self) -> &Arc<Renderer> {
        &self.renderer
    }

    pub fn mapper(&self) -> &Arc<CoordinateMapper> {
        self.renderer.mapper()
    }

    fn transition(&self, state: PipelineState) {
        self.state.set(state);
        info!(?state, source = self.source.name(), "pipeline state changed");
        let _ = self.events_tx.try_send(PipelineEvent::StateChanged(state));
    }

    /// Stopped -> Starting. Spawns the worker, initialises the detector and
    /// acquires the frame source. Any failure leaves the pipeline Stopped.
    #[instrument(skip(self), fields(source = self.source.name()))]
    pub fn start(&mut self) -> Result<(), PipelineError> {
        let state = self.state();
        if state != PipelineState::Stopped {
            return Err(PipelineError::InvalidState { state });
        }
        self.settings.validate()?;
        self.transition(PipelineState::Starting);

        let queue = Arc::new(FrameQueue::new(self.settings.pipeline.queue_capacity));
        let stats = Arc::new(WorkerStats::default());
        let params = self.settings.detector.resolved();
        debug!(?params, "resolved detector parameters");

        let spawned = worker::spawn(
            self.detector.clone(),
            WorkerSpawn {
                queue: queue.clone(),
                renderer: self.renderer.clone(),
                events: self.events_tx.clone(),
                stats: stats.clone(),
                params,
                diagnostics: self.settings.pipeline.diagnostics,
                core: self.settings.pipeline.worker_core,
            },
        );
        let worker = match spawned {
            Ok(worker) => worker,
            Err(err) => {
                error!(error = %err, "failed to spawn detection worker");
                self.transition(PipelineState::Stopped);
                return Err(PipelineError::WorkerSpawn(err));
            }
        };

        let ready = worker
            .ready
            .recv()
            .unwrap_or(Err(DetectorError::NotInitialised));
        if let Err(err) = ready {
            error!(error = %err, "detector initialisation failed");
            queue.close();
            join_worker(worker);
            self.transition(PipelineState::Stopped);
            return Err(PipelineError::DetectorInit(err));
        }

        let sink = FrameSink::new(queue.clone(), self.state.clone(), self.events_tx.clone());
        if let Err(err) = self.source.start(&self.settings.capture, sink.clone()) {
            error!(
                error = %err,
                device = %self.settings.capture.device,
                "frame source unavailable"
            );
            sink.stop_accepting();
            queue.close();
            join_worker(worker);
            self.transition(PipelineState::Stopped);
            return Err(PipelineError::HardwareUnavailable(err));
        }

        info!(
            width = self.settings.capture.width,
            height = self.settings.capture.height,
            fps = self.settings.capture.fps,
            capacity = queue.capacity(),
            "frame source acquired, waiting for first frame"
        );
        self.running = Some(Running {
            queue,
            sink,
            worker,
            stats,
        });
        Ok(())
    }

    /// Running/Starting -> Draining -> Stopped. A no-op when already stopped.
    ///
    /// The worker is joined before the source is released, so no late frame
    /// callback can reach a torn-down pipeline.
    #[instrument(skip(self), fields(source = self.source.name()))]
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        self.transition(PipelineState::Draining);

        running.sink.stop_accepting();
        let released = running.queue.close();
        join_worker(running.worker);
        self.source.stop();

        let queue = running.queue.stats();
        self.history.enqueued += queue.enqueued;
        self.history.dropped += queue.dropped;
        self.history.processed += running.stats.processed();
        self.history.detector_failures += running.stats.failures();
        info!(
            released,
            enqueued = queue.enqueued,
            dropped = queue.dropped,
            processed = running.stats.processed(),
            "pipeline drained"
        );
        self.transition(PipelineState::Stopped);
    }

    /// Apply new settings.
    ///
    /// While running, a change confined to detector parameters is handed to
    /// the worker and applied between two detections; a display change only
    /// updates the mapper and surface; anything else restarts the pipeline.
    ///
    /// Detector parameters the detector rejects fail with
    /// [`PipelineError::DetectorInit`]; the current settings stay in effect.
    #[instrument(skip_all)]
    pub fn reconfigure(&mut self, settings: Settings) -> Result<(), PipelineError> {
        settings.validate()?;
        if settings == self.settings {
            return Ok(());
        }

        let restart = self.running.is_some()
            && (settings.capture != self.settings.capture || settings.pipeline != self.settings.pipeline);
        if restart {
            info!("capture or pipeline settings changed, restarting");
            self.stop();
            self.apply_display(&settings);
            self.settings = settings;
            return self.start();
        }

        if settings.detector != self.settings.detector {
            if let Some(running) = &self.running {
                let params = settings.detector.resolved();
                info!(?params, "forwarding detector parameters to worker");
                let (reply, outcome) = flume::bounded(1);
                let command = WorkerCommand::Reconfigure { params, reply };
                if running.worker.commands.send(command).is_ok() {
                    running.queue.wake();
                    match outcome.recv() {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            warn!(error = %err, "detector rejected parameters, keeping current settings");
                            return Err(PipelineError::DetectorInit(err));
                        }
                        Err(_) => warn!("detection worker exited, parameters apply on next start"),
                    }
                } else {
                    warn!("detection worker is gone, parameters apply on next start");
                }
            }
        }
        self.apply_display(&settings);
        self.settings = settings;
        Ok(())
    }

    fn apply_display(&self, settings: &Settings) {
        let mapper = self.mapper();
        mapper.set_rotation(display_rotation(settings));
        mapper.set_mirror(settings.capture.facing == Facing::Front);

        let (old, new) = (&self.settings.display, &settings.display);
        if (old.width, old.height) != (new.width, new.height) {
            self.renderer.resize(new.width, new.height);
        }
    }

    /// Device rotation changed (degrees, snapped to quarter turns).
    pub fn set_display_rotation(&mut self, degrees: u32) {
        self.settings.display.rotation = degrees;
        let rotation = display_rotation(&self.settings);
        if self.mapper().set_rotation(rotation) {
            info!(degrees, rotation = rotation.degrees(), "display rotation changed");
        }
    }

    /// Presentation surface was laid out or resized.
    pub fn resize_display(&mut self, width: u32, height: u32) {
        self.settings.display.width = width;
        self.settings.display.height = height;
        self.renderer.resize(width, height);
    }

    /// Draw the latest detections from a presentation callback.
    pub fn render_pending(&self) -> crate::display::RenderOutcome {
        self.renderer.render_pending()
    }

    pub fn stats(&self) -> PipelineStats {
        let mut stats = self.history;
        if let Some(running) = &self.running {
            let queue = running.queue.stats();
            stats.enqueued += queue.enqueued;
            stats.dropped += queue.dropped;
            stats.processed += running.stats.processed();
            stats.detector_failures += running.stats.failures();
        }
        let render = self.renderer.stats();
        stats.rendered = render.rendered;
        stats.superseded = render.superseded;
        stats.renders_skipped = render.deferred + render.surface_lost;
        stats
    }

    /// Frames currently waiting for the worker.
    pub fn queued(&self) -> usize {
        self.running.as_ref().map_or(0, |r| r.queue.len())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_worker(worker: WorkerHandle) {
    if worker.join.join().is_err() {
        error!("detection worker panicked");
    }
}
