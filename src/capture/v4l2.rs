//! V4L2 capture through memory-mapped buffers.
//!
//! The device is opened and configured for YUYV in `start`, so a missing or
//! incompatible camera fails the pipeline start. Streaming happens on a
//! dedicated thread that extracts the luma plane into pooled GRAY8 frames.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::{info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::frame::{FrameMetadata, FramePool, PixelFormat};
use crate::capture::source::FrameSource;
use crate::errors::SourceError;
use crate::pipeline::FrameSink;
use crate::settings::CaptureSettings;
use crate::utils;

/// Consecutive dequeue errors tolerated before the stream is abandoned.
const MAX_STREAM_ERRORS: u32 = 16;

#[derive(Default)]
pub struct V4l2Source {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    device: String,
}

impl V4l2Source {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Copy the Y samples out of a packed YUYV image.
fn yuyv_luma<E: Extend<u8>>(src: &[u8], width: usize, height: usize, stride: usize, dst: &mut E) {
    for row in src.chunks(stride).take(height) {
        dst.extend(row.iter().step_by(2).take(width).copied());
    }
}

impl FrameSource for V4l2Source {
    fn start(&mut self, settings: &CaptureSettings, sink: FrameSink) -> Result<(), SourceError> {
        if self.thread.is_some() {
            return Err(SourceError::AlreadyStarted);
        }

        let path = if settings.device == "auto" {
            utils::auto_detect_device()?
        } else {
            settings.device.clone()
        };
        let open_err = |source: io::Error| SourceError::Open {
            path: path.clone(),
            source,
        };

        let device = Device::with_path(&path).map_err(open_err)?;
        let caps = device.query_caps().map_err(open_err)?;
        info!(device = %path, card = %caps.card, driver = %caps.driver, "opened capture device");
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(SourceError::Unsupported("video capture".into()));
        }

        let mut fmt = device.format().map_err(open_err)?;
        fmt.width = settings.width;
        fmt.height = settings.height;
        fmt.fourcc = FourCC::new(b"YUYV");
        let fmt = device.set_format(&fmt).map_err(open_err)?;
        if fmt.fourcc != FourCC::new(b"YUYV") {
            return Err(SourceError::Unsupported(format!("YUYV (driver offered {})", fmt.fourcc)));
        }
        if (fmt.width, fmt.height) != (settings.width, settings.height) {
            warn!(
                requested_width = settings.width,
                requested_height = settings.height,
                width = fmt.width,
                height = fmt.height,
                "driver adjusted capture size"
            );
        }

        let mut stream: MmapStream<'static> =
            MmapStream::with_buffers(&device, Type::VideoCapture, settings.buffer_count)
                .map_err(open_err)?;

        let (width, height) = (fmt.width, fmt.height);
        let stride = (fmt.stride as usize).max(width as usize * 2);
        let pool = FramePool::new(
            settings.buffer_count as usize,
            PixelFormat::Gray8.buffer_len(width, height),
        );
        let running = self.running.clone();
        running.store(true, Ordering::Release);

        let thread = utils::spawn_named("v4l2-capture", move || {
            // Keep the device open for as long as the stream is alive.
            let _device = device;
            let mut sequence = 0u64;
            let mut errors = 0u32;
            while running.load(Ordering::Acquire) {
                let (buf, _meta) = match stream.next() {
                    Ok(next) => {
                        errors = 0;
                        next
                    }
                    Err(err) => {
                        errors += 1;
                        warn!(error = %err, errors, "failed to dequeue capture buffer");
                        if errors >= MAX_STREAM_ERRORS {
                            break;
                        }
                        continue;
                    }
                };

                sequence += 1;
                let meta = FrameMetadata {
                    sequence,
                    width,
                    height,
                    stride: width,
                    format: PixelFormat::Gray8,
                };
                let frame = pool.frame_with(meta, Instant::now(), |dst| {
                    yuyv_luma(buf, width as usize, height as usize, stride, dst)
                });
                sink.deliver(frame);
            }
            info!(frames = sequence, "v4l2 stream closed");
        })
        .map_err(SourceError::Spawn)?;

        info!(width, height, buffers = settings.buffer_count, "capture stream started");
        self.device = path;
        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            info!(device = %self.device, "capture device released");
        }
    }

    fn name(&self) -> &str {
        "v4l2"
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_luma_skips_chroma_and_padding() {
        // 2x2 image, stride 6 (4 bytes of pixels + 2 padding).
        let src = [10, 1, 20, 2, 99, 99, 30, 3, 40, 4, 99, 99];
        let mut luma = Vec::new();
        yuyv_luma(&src, 2, 2, 6, &mut luma);
        assert_eq!(luma, vec![10, 20, 30, 40]);
    }
}
