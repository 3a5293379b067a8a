//! Callback handle given to frame sources.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{info, trace, warn};

use crate::capture::Frame;
use crate::pipeline::fps::FpsMeter;
use crate::pipeline::queue::{Enqueued, FrameQueue};
use crate::pipeline::{PipelineEvent, PipelineState, StateCell};

struct CaptureWindow {
    fps: FpsMeter,
    dropped_at_start: u64,
}

struct SinkInner {
    queue: Arc<FrameQueue>,
    state: Arc<StateCell>,
    events: flume::Sender<PipelineEvent>,
    accepting: AtomicBool,
    window: Mutex<CaptureWindow>,
}

/// Where a frame source delivers captured frames.
///
/// Delivery never blocks on the detection worker. Once the pipeline starts
/// draining, delivered frames are released immediately.
#[derive(Clone)]
pub struct FrameSink {
    inner: Arc<SinkInner>,
}

impl FrameSink {
    pub(crate) fn new(
        queue: Arc<FrameQueue>,
        state: Arc<StateCell>,
        events: flume::Sender<PipelineEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                queue,
                state,
                events,
                accepting: AtomicBool::new(true),
                window: Mutex::new(CaptureWindow {
                    fps: FpsMeter::new(),
                    dropped_at_start: 0,
                }),
            }),
        }
    }

    /// Hand a captured frame to the pipeline. Returns whether it was queued.
    pub fn deliver(&self, frame: Frame) -> bool {
        let inner = &self.inner;
        if !inner.accepting.load(Ordering::Acquire) {
            trace!(sequence = frame.meta().sequence, "pipeline draining, releasing frame");
            return false;
        }

        if inner.state.advance(PipelineState::Starting, PipelineState::Running) {
            let meta = frame.meta();
            info!(width = meta.width, height = meta.height, "first frame received, pipeline running");
            let _ = inner
                .events
                .try_send(PipelineEvent::StateChanged(PipelineState::Running));
        }

        let accepted = match inner.queue.enqueue(frame) {
            Enqueued::Accepted | Enqueued::Replaced(_) => true,
            Enqueued::Rejected(_) => false,
        };
        self.tick_capture();
        accepted
    }

    /// Whether frames are still being accepted.
    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    pub(crate) fn stop_accepting(&self) {
        self.inner.accepting.store(false, Ordering::Release);
    }

    fn tick_capture(&self) {
        let inner = &self.inner;
        let mut window = inner.window.lock().unwrap_or_else(|p| p.into_inner());
        let Some(fps) = window.fps.tick() else {
            return;
        };

        metrics::gauge!("tagview_capture_fps").set(fps);
        let _ = inner.events.try_send(PipelineEvent::CaptureFps(fps));

        let total_dropped = inner.queue.stats().dropped;
        let dropped = total_dropped - window.dropped_at_start;
        window.dropped_at_start = total_dropped;
        if dropped > 0 {
            warn!(
                dropped,
                total_dropped,
                capture_fps = fps,
                "detector is falling behind capture, frames dropped"
            );
            let _ = inner.events.try_send(PipelineEvent::Backpressure {
                dropped,
                total_dropped,
            });
        }
    }
}
