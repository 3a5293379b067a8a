//! Detection worker: the only code that ever calls the tag detector.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::{debug, error, info, trace, warn};

use crate::capture::Frame;
use crate::detect::{Detection, DetectorParams, TagDetector};
use crate::display::{DetectionSet, RenderOutcome, Renderer};
use crate::errors::DetectorError;
use crate::pipeline::fps::FpsMeter;
use crate::pipeline::queue::{FrameQueue, Waited};
use crate::pipeline::PipelineEvent;
use crate::utils;

/// Where the detector lives while no worker owns it.
pub(crate) type DetectorSlot = Arc<Mutex<Option<Box<dyn TagDetector>>>>;

/// Messages from the pipeline to a running worker.
#[derive(Debug, Clone)]
pub(crate) enum WorkerCommand {
    /// Re-run `init` before the next detection and report the outcome.
    /// Rejected parameters leave the previous ones in effect.
    Reconfigure {
        params: DetectorParams,
        reply: flume::Sender<Result<(), DetectorError>>,
    },
}

/// Counters shared between the worker and the pipeline.
#[derive(Debug, Default)]
pub struct WorkerStats {
    processed: AtomicU64,
    failures: AtomicU64,
}

impl WorkerStats {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Drains the frame queue on one dedicated thread.
pub struct DetectionWorker {
    detector: Box<dyn TagDetector>,
    /// Parameters the detector was last initialised with.
    params: DetectorParams,
    queue: Arc<FrameQueue>,
    renderer: Arc<Renderer>,
    commands: Option<flume::Receiver<WorkerCommand>>,
    events: Option<flume::Sender<PipelineEvent>>,
    stats: Arc<WorkerStats>,
    fps: FpsMeter,
    diagnostics: bool,
}

impl DetectionWorker {
    pub fn new(detector: Box<dyn TagDetector>, queue: Arc<FrameQueue>, renderer: Arc<Renderer>) -> Self {
        Self {
            detector,
            params: DetectorParams::default(),
            queue,
            renderer,
            commands: None,
            events: None,
            stats: Arc::new(WorkerStats::default()),
            fps: FpsMeter::new(),
            diagnostics: false,
        }
    }

    pub fn with_diagnostics(mut self, enabled: bool) -> Self {
        self.diagnostics = enabled;
        self
    }

    pub(crate) fn with_events(mut self, events: flume::Sender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub(crate) fn with_commands(mut self, commands: flume::Receiver<WorkerCommand>) -> Self {
        self.commands = Some(commands);
        self
    }

    pub(crate) fn with_stats(mut self, stats: Arc<WorkerStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    pub fn init(&mut self, params: &DetectorParams) -> Result<(), DetectorError> {
        self.detector.init(params)?;
        self.params = params.clone();
        Ok(())
    }

    /// Hand the detector back once the worker is done with it.
    pub fn into_detector(self) -> Box<dyn TagDetector> {
        self.detector
    }

    /// Process frames until the queue is closed.
    ///
    /// Commands are applied before each detection, or as soon as the queue
    /// is woken while idle.
    pub fn run(&mut self) {
        info!(capacity = self.queue.capacity(), "detection worker started");
        loop {
            match self.queue.wait() {
                Waited::Frame(frame) => {
                    self.apply_commands();
                    self.cycle(frame);
                }
                Waited::Woken => self.apply_commands(),
                Waited::Closed => break,
            }
        }
        info!(
            processed = self.stats.processed(),
            failures = self.stats.failures(),
            "detection worker exiting"
        );
    }

    fn apply_commands(&mut self) {
        let Some(commands) = self.commands.clone() else {
            return;
        };
        while let Ok(command) = commands.try_recv() {
            match command {
                WorkerCommand::Reconfigure { params, reply } => {
                    let result = self.reconfigure(&params);
                    let _ = reply.send(result);
                }
            }
        }
    }

    fn reconfigure(&mut self, params: &DetectorParams) -> Result<(), DetectorError> {
        match self.init(params) {
            Ok(()) => {
                info!(?params, "detector reconfigured");
                Ok(())
            }
            Err(err) => {
                error!(?params, error = %err, "detector rejected parameters, restoring previous ones");
                let previous = self.params.clone();
                if let Err(restore) = self.detector.init(&previous) {
                    error!(params = ?previous, error = %restore, "failed to restore detector parameters");
                }
                Err(err)
            }
        }
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        let luma = frame.luma();
        luma.validate()?;
        self.detector.detect(luma)
    }

    /// Run one detect + render cycle for `frame`.
    ///
    /// Returns `None` when the pipeline was stopped while the frame was in
    /// flight; its detections are discarded.
    pub fn cycle(&mut self, frame: Frame) -> Option<RenderOutcome> {
        let meta = *frame.meta();
        let detect_start = Instant::now();

        let detections = match self.detect(&frame) {
            Ok(detections) => detections,
            Err(err) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("tagview_detector_failures_total").increment(1);
                warn!(
                    sequence = meta.sequence,
                    width = meta.width,
                    height = meta.height,
                    stride = meta.stride,
                    error = %err,
                    "detector failed, treating frame as empty"
                );
                Vec::new()
            }
        };
        let completed_at = Instant::now();
        let detect_ms = completed_at.duration_since(detect_start).as_secs_f64() * 1000.0;
        let tags = detections.len();
        let enqueued_at = frame.enqueued_at();
        // The buffer goes back to the source before drawing starts.
        drop(frame);

        // Nothing is submitted once stop has closed the queue, and stop waits
        // for a pass that already began.
        let renderer = &self.renderer;
        let outcome = self.queue.if_open(|| {
            renderer.mapper().set_source_size(meta.width, meta.height);
            renderer.submit(DetectionSet {
                sequence: meta.sequence,
                detections,
                completed_at,
            });
            renderer.render_pending()
        });
        let Some(outcome) = outcome else {
            debug!(sequence = meta.sequence, "stop requested, discarding in-flight detections");
            return None;
        };

        if let Some(enqueued_at) = enqueued_at {
            let latency = completed_at.saturating_duration_since(enqueued_at);
            metrics::histogram!("tagview_detection_latency_ms").record(latency.as_secs_f64() * 1000.0);
        }
        if self.diagnostics {
            info!(
                sequence = meta.sequence,
                width = meta.width,
                height = meta.height,
                tags,
                detect_ms,
                "frame processed"
            );
        } else {
            trace!(sequence = meta.sequence, tags, detect_ms, "frame processed");
        }

        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        if let Some(fps) = self.fps.tick() {
            metrics::gauge!("tagview_detect_fps").set(fps);
            debug!(fps, "detect+render rate");
            if let Some(events) = &self.events {
                let _ = events.try_send(PipelineEvent::DetectFps(fps));
            }
        }

        Some(outcome)
    }
}

/// Settings for a spawned worker thread.
pub(crate) struct WorkerSpawn {
    pub queue: Arc<FrameQueue>,
    pub renderer: Arc<Renderer>,
    pub events: flume::Sender<PipelineEvent>,
    pub stats: Arc<WorkerStats>,
    pub params: DetectorParams,
    pub diagnostics: bool,
    pub core: Option<usize>,
}

/// A running worker thread.
pub(crate) struct WorkerHandle {
    pub join: JoinHandle<()>,
    pub commands: flume::Sender<WorkerCommand>,
    /// Resolves once the detector has been initialised on the worker thread.
    pub ready: flume::Receiver<Result<(), DetectorError>>,
}

/// Spawn the worker thread. The detector is taken from `slot` on the worker
/// thread and put back when the worker exits.
pub(crate) fn spawn(slot: DetectorSlot, spec: WorkerSpawn) -> io::Result<WorkerHandle> {
    let (command_tx, command_rx) = flume::unbounded();
    let (ready_tx, ready_rx) = flume::bounded(1);

    let join = utils::spawn_named("tag-detector", move || {
        if let Some(core) = spec.core {
            utils::pin_current_thread(core);
        }

        let detector = slot.lock().unwrap_or_else(|p| p.into_inner()).take();
        let Some(detector) = detector else {
            let _ = ready_tx.send(Err(DetectorError::Failed("detector is unavailable".into())));
            return;
        };

        let mut worker = DetectionWorker::new(detector, spec.queue, spec.renderer)
            .with_diagnostics(spec.diagnostics)
            .with_events(spec.events)
            .with_commands(command_rx)
            .with_stats(spec.stats);

        let init = worker.init(&spec.params);
        let initialised = init.is_ok();
        let _ = ready_tx.send(init);
        if initialised {
            worker.run();
        }

        *slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(worker.into_detector());
    })?;

    Ok(WorkerHandle {
        join,
        commands: command_tx,
        ready: ready_rx,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BytesMut;

    use super::*;
    use crate::capture::{FrameMetadata, PixelFormat};
    use crate::detect::LumaView;
    use crate::display::{CoordinateMapper, RasterSurface, Rotation};

    /// Fails on the listed sequences, otherwise reports one tag.
    #[derive(Default)]
    struct Scripted {
        fail_on: Vec<u64>,
        calls: u64,
        close_queue: Option<Arc<FrameQueue>>,
        /// Families `init` refuses.
        reject_family: Option<&'static str>,
        inits: Arc<Mutex<Vec<String>>>,
    }

    impl TagDetector for Scripted {
        fn init(&mut self, params: &DetectorParams) -> Result<(), DetectorError> {
            if self.reject_family == Some(params.tag_family.as_str()) {
                return Err(DetectorError::InvalidParams(format!("unknown family {}", params.tag_family)));
            }
            self.inits.lock().unwrap().push(params.tag_family.clone());
            Ok(())
        }

        fn detect(&mut self, _image: LumaView<'_>) -> Result<Vec<Detection>, DetectorError> {
            self.calls += 1;
            if let Some(queue) = &self.close_queue {
                queue.close();
            }
            if self.fail_on.contains(&self.calls) {
                return Err(DetectorError::Failed("scripted".into()));
            }
            Ok(vec![Detection::from_flat(
                1,
                0,
                [20.0, 20.0],
                [10.0, 10.0, 30.0, 10.0, 30.0, 30.0, 10.0, 30.0],
            )])
        }
    }

    fn frame(sequence: u64) -> Frame {
        let meta = FrameMetadata {
            sequence,
            width: 64,
            height: 48,
            stride: 64,
            format: PixelFormat::Gray8,
        };
        Frame::new(BytesMut::zeroed(64 * 48), meta, Instant::now())
    }

    fn setup(detector: Scripted, queue: Arc<FrameQueue>) -> DetectionWorker {
        let mapper = Arc::new(CoordinateMapper::new(Rotation::Deg0, false));
        let renderer = Arc::new(Renderer::new(RasterSurface::new(64, 48), mapper));
        DetectionWorker::new(Box::new(detector), queue, renderer)
    }

    #[test]
    fn test_continues_after_detector_failure() {
        let queue = Arc::new(FrameQueue::new(1));
        let detector = Scripted {
            fail_on: vec![1],
            ..Default::default()
        };
        let mut worker = setup(detector, queue);

        assert_eq!(
            worker.cycle(frame(1)),
            Some(RenderOutcome::Rendered { drawn: 0, failed: 0 })
        );
        assert_eq!(
            worker.cycle(frame(2)),
            Some(RenderOutcome::Rendered { drawn: 1, failed: 0 })
        );
        assert_eq!(worker.stats().failures(), 1);
        assert_eq!(worker.stats().processed(), 2);
    }

    #[test]
    fn test_invalid_frame_counts_as_failure() {
        let queue = Arc::new(FrameQueue::new(1));
        let detector = Scripted::default();
        let mut worker = setup(detector, queue);

        let meta = FrameMetadata {
            sequence: 9,
            width: 64,
            height: 48,
            stride: 64,
            format: PixelFormat::Gray8,
        };
        let short = Frame::new(BytesMut::zeroed(10), meta, Instant::now());
        assert_eq!(
            worker.cycle(short),
            Some(RenderOutcome::Rendered { drawn: 0, failed: 0 })
        );
        assert_eq!(worker.stats().failures(), 1);
    }

    #[test]
    fn test_discards_result_when_stopped_mid_detection() {
        let queue = Arc::new(FrameQueue::new(1));
        let detector = Scripted {
            close_queue: Some(queue.clone()),
            ..Default::default()
        };
        let mut worker = setup(detector, queue);

        assert_eq!(worker.cycle(frame(1)), None);
        assert_eq!(worker.stats().processed(), 0);
        assert_eq!(worker.renderer.stats().submitted, 0);
    }

    #[test]
    fn test_spawned_worker_exits_on_close_and_returns_detector() {
        let queue = Arc::new(FrameQueue::new(1));
        let mapper = Arc::new(CoordinateMapper::new(Rotation::Deg0, false));
        let renderer = Arc::new(Renderer::new(RasterSurface::new(64, 48), mapper));
        let detector: Box<dyn TagDetector> = Box::new(Scripted::default());
        let slot: DetectorSlot = Arc::new(Mutex::new(Some(detector)));
        let (events, _events_rx) = flume::bounded(8);
        let stats = Arc::new(WorkerStats::default());

        let handle = spawn(
            slot.clone(),
            WorkerSpawn {
                queue: queue.clone(),
                renderer,
                events,
                stats: stats.clone(),
                params: DetectorParams::default(),
                diagnostics: true,
                core: None,
            },
        )
        .unwrap();

        assert!(handle.ready.recv().unwrap().is_ok());
        queue.enqueue(frame(1));
        let (reply, _replies) = flume::bounded(1);
        handle
            .commands
            .send(WorkerCommand::Reconfigure {
                params: DetectorParams::default(),
                reply,
            })
            .unwrap();
        queue.enqueue(frame(2));

        queue.close();
        handle.join.join().unwrap();
        assert!(slot.lock().unwrap().is_some());
        assert!(stats.processed() <= 2);
    }

    #[test]
    fn test_rejected_reconfigure_restores_previous_params() {
        let queue = Arc::new(FrameQueue::new(1));
        let mapper = Arc::new(CoordinateMapper::new(Rotation::Deg0, false));
        let renderer = Arc::new(Renderer::new(RasterSurface::new(64, 48), mapper));
        let inits = Arc::new(Mutex::new(Vec::new()));
        let detector: Box<dyn TagDetector> = Box::new(Scripted {
            reject_family: Some("bogus"),
            inits: inits.clone(),
            ..Default::default()
        });
        let slot: DetectorSlot = Arc::new(Mutex::new(Some(detector)));
        let (events, _events_rx) = flume::bounded(8);

        let handle = spawn(
            slot.clone(),
            WorkerSpawn {
                queue: queue.clone(),
                renderer,
                events,
                stats: Arc::new(WorkerStats::default()),
                params: DetectorParams::default(),
                diagnostics: false,
                core: None,
            },
        )
        .unwrap();
        assert!(handle.ready.recv().unwrap().is_ok());

        // No frame is queued; waking the idle worker is enough.
        let reconfigure = |family: &str| {
            let (reply, replies) = flume::bounded(1);
            let params = DetectorParams {
                tag_family: family.into(),
                ..DetectorParams::default()
            };
            handle
                .commands
                .send(WorkerCommand::Reconfigure { params, reply })
                .unwrap();
            queue.wake();
            replies.recv_timeout(Duration::from_secs(5)).unwrap()
        };

        assert!(matches!(reconfigure("bogus"), Err(DetectorError::InvalidParams(_))));
        assert!(reconfigure("tag25h9").is_ok());

        queue.close();
        handle.join.join().unwrap();
        assert_eq!(
            *inits.lock().unwrap(),
            vec!["tag36h11".to_string(), "tag36h11".into(), "tag25h9".into()]
        );
    }

    #[test]
    fn test_nothing_rendered_after_close() {
        let queue = Arc::new(FrameQueue::new(1));
        let mut worker = setup(Scripted::default(), queue.clone());

        assert!(worker.cycle(frame(1)).is_some());
        queue.close();
        assert_eq!(worker.cycle(frame(2)), None);
        let stats = worker.renderer.stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.rendered, 1);
    }
}
