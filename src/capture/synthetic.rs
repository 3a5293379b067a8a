//! Generated frames for running the pipeline without a camera.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::{debug, info};

use crate::capture::frame::{FrameMetadata, FramePool};
use crate::capture::source::FrameSource;
use crate::errors::SourceError;
use crate::pipeline::FrameSink;
use crate::settings::CaptureSettings;
use crate::utils;

const BACKGROUND: u8 = 32;
const MARKER: u8 = 235;
const MARKER_SIZE: u32 = 48;
const NEUTRAL_CHROMA: u8 = 128;

/// Paints a bright square sliding across a dark background.
#[derive(Default)]
pub struct SyntheticSource {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    frame_limit: Option<u64>,
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop producing after `frames` frames.
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }
}

/// Left edge of the marker for frame `sequence`.
fn marker_x(sequence: u64, width: u32) -> u32 {
    let travel = width.saturating_sub(MARKER_SIZE).max(1);
    ((sequence * 4) % u64::from(travel)) as u32
}

/// Fill `buf` with one frame of `meta.format`.
fn paint(buf: &mut BytesMut, meta: &FrameMetadata) {
    let (width, height, stride) = (meta.width, meta.height, meta.stride as usize);
    let luma_len = stride * height as usize;
    buf.clear();
    buf.resize(meta.format.buffer_len(meta.stride, height), NEUTRAL_CHROMA);
    buf[..luma_len].fill(BACKGROUND);

    let x0 = marker_x(meta.sequence, width) as usize;
    let y0 = (height.saturating_sub(MARKER_SIZE) / 2) as usize;
    let x1 = (x0 + MARKER_SIZE as usize).min(width as usize);
    let y1 = (y0 + MARKER_SIZE as usize).min(height as usize);
    for row in y0..y1 {
        buf[row * stride + x0..row * stride + x1].fill(MARKER);
    }
}

impl FrameSource for SyntheticSource {
    fn start(&mut self, settings: &CaptureSettings, sink: FrameSink) -> Result<(), SourceError> {
        if self.thread.is_some() {
            return Err(SourceError::AlreadyStarted);
        }

        let base = FrameMetadata {
            sequence: 0,
            width: settings.width,
            height: settings.height,
            stride: settings.width,
            format: settings.format,
        };
        let interval = Duration::from_secs_f64(1.0 / f64::from(settings.fps.max(1)));
        let pool = FramePool::new(
            settings.buffer_count as usize,
            settings.format.buffer_len(base.stride, base.height),
        );
        let limit = self.frame_limit;
        let running = self.running.clone();
        running.store(true, Ordering::Release);

        let thread = utils::spawn_named("synthetic-capture", move || {
            let mut next = Instant::now();
            let mut sequence = 0u64;
            while running.load(Ordering::Acquire) && limit.map_or(true, |n| sequence < n) {
                sequence += 1;
                let meta = FrameMetadata { sequence, ..base };
                let frame = pool.frame_with(meta, Instant::now(), |buf| paint(buf, &meta));
                sink.deliver(frame);

                next += interval;
                let now = Instant::now();
                if next > now {
                    std::thread::sleep(next - now);
                } else {
                    next = now;
                }
            }
            debug!(frames = sequence, "synthetic capture finished");
        })
        .map_err(SourceError::Spawn)?;

        info!(
            width = settings.width,
            height = settings.height,
            fps = settings.fps,
            format = ?settings.format,
            "synthetic capture started"
        );
        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            info!("synthetic capture stopped");
        }
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use crate::pipeline::{FrameQueue, PipelineState, StateCell};

    #[test]
    fn test_paint_places_marker_and_chroma() {
        let meta = FrameMetadata {
            sequence: 0,
            width: 128,
            height: 96,
            stride: 128,
            format: PixelFormat::Nv21,
        };
        let mut buf = BytesMut::new();
        paint(&mut buf, &meta);

        assert_eq!(buf.len(), 128 * 96 * 3 / 2);
        assert_eq!(buf[0], BACKGROUND);
        // Marker starts at x = 0 on the first frame, vertically centered.
        assert_eq!(buf[48 * 128 + 10], MARKER);
        assert_eq!(buf[48 * 128 + 100], BACKGROUND);
        assert_eq!(buf[128 * 96], NEUTRAL_CHROMA);
    }

    #[test]
    fn test_marker_moves_and_wraps() {
        assert_eq!(marker_x(0, 128), 0);
        assert_eq!(marker_x(5, 128), 20);
        assert_eq!(marker_x(20, 128), 0);
        assert_eq!(marker_x(3, 16), 0);
    }

    #[test]
    fn test_delivers_limited_frames_then_stops() {
        let queue = Arc::new(FrameQueue::new(8));
        let state = Arc::new(StateCell::new(PipelineState::Starting));
        let (events, _rx) = flume::bounded(16);
        let sink = FrameSink::new(queue.clone(), state.clone(), events);

        let settings = CaptureSettings {
            width: 64,
            height: 48,
            fps: 500,
            format: PixelFormat::Gray8,
            ..CaptureSettings::default()
        };
        let mut source = SyntheticSource::new().with_frame_limit(3);
        source.start(&settings, sink.clone()).unwrap();
        assert!(matches!(
            source.start(&settings, sink),
            Err(SourceError::AlreadyStarted)
        ));

        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.len() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        source.stop();

        assert_eq!(queue.len(), 3);
        assert_eq!(state.get(), PipelineState::Running);
        let first = queue.try_take().unwrap();
        assert_eq!(first.meta().sequence, 1);
        assert!(first.is_valid());
    }
}
