//! Captured frames and the buffer pool they are recycled through.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::detect::LumaView;

/// Pixel formats a frame source may deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Luma plane followed by interleaved V/U at quarter resolution.
    Nv21,
    /// Luma plane followed by interleaved U/V at quarter resolution.
    Nv12,
    /// Luma only.
    Gray8,
}

impl PixelFormat {
    /// Bytes required for a `height` row image with the given luma stride.
    pub fn buffer_len(self, stride: u32, height: u32) -> usize {
        let luma = stride as usize * height as usize;
        match self {
            PixelFormat::Nv21 | PixelFormat::Nv12 => luma + luma.div_ceil(2),
            PixelFormat::Gray8 => luma,
        }
    }
}

/// Frame metadata
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Luma row stride in bytes.
    pub stride: u32,
    pub format: PixelFormat,
}

/// One captured image.
///
/// A frame is never cloned: it is moved from the source into the queue and
/// from the queue into the detection worker, so exactly one owner holds the
/// buffer at any time. Dropping a pooled frame hands its buffer back to the
/// [`FramePool`] it came from.
pub struct Frame {
    data: BytesMut,
    meta: FrameMetadata,
    captured_at: Instant,
    enqueued_at: Option<Instant>,
    pool: Option<Arc<ArrayQueue<BytesMut>>>,
}

impl Frame {
    /// Wrap an owned buffer that does not belong to any pool.
    pub fn new(data: BytesMut, meta: FrameMetadata, captured_at: Instant) -> Self {
        Self {
            data,
            meta,
            captured_at,
            enqueued_at: None,
            pool: None,
        }
    }

    pub fn meta(&self) -> &FrameMetadata {
        &self.meta
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Time the frame entered the queue, if it has been queued.
    pub fn enqueued_at(&self) -> Option<Instant> {
        self.enqueued_at
    }

    pub(crate) fn mark_enqueued(&mut self, at: Instant) {
        self.enqueued_at = Some(at);
    }

    /// The luma plane as handed to the detector.
    pub fn luma(&self) -> LumaView<'_> {
        let luma_len = (self.meta.stride as usize * self.meta.height as usize).min(self.data.len());
        LumaView {
            buffer: &self.data[..luma_len],
            width: self.meta.width,
            height: self.meta.height,
            stride: self.meta.stride,
        }
    }

    /// Whether the buffer is large enough for the declared geometry.
    pub fn is_valid(&self) -> bool {
        self.meta.width > 0
            && self.meta.height > 0
            && self.meta.stride >= self.meta.width
            && self.data.len() >= self.meta.format.buffer_len(self.meta.stride, self.meta.height)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("meta", &self.meta)
            .field("len", &self.data.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let mut buf = std::mem::take(&mut self.data);
            buf.clear();
            // A full pool means the source shrank its working set; let the buffer go.
            let _ = pool.push(buf);
        }
    }
}

/// Fixed-size pool of capture buffers shared by a source and its frames.
#[derive(Clone)]
pub struct FramePool {
    free: Arc<ArrayQueue<BytesMut>>,
    buffer_len: usize,
}

impl FramePool {
    /// Pre-allocate `count` buffers of `buffer_len` bytes.
    pub fn new(count: usize, buffer_len: usize) -> Self {
        let free = Arc::new(ArrayQueue::new(count.max(1)));
        for _ in 0..count {
            let _ = free.push(BytesMut::with_capacity(buffer_len));
        }
        Self { free, buffer_len }
    }

    /// Number of buffers currently available for capture.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Build a pooled frame by copying `pixels` into a recycled buffer.
    pub fn frame_from(&self, pixels: &[u8], meta: FrameMetadata, captured_at: Instant) -> Frame {
        self.frame_with(meta, captured_at, |buf| buf.extend_from_slice(pixels))
    }

    /// Build a pooled frame, letting `fill` write the pixels into an empty buffer.
    pub fn frame_with<F>(&self, meta: FrameMetadata, captured_at: Instant, fill: F) -> Frame
    where
        F: FnOnce(&mut BytesMut),
    {
        let mut data = match self.free.pop() {
            Some(buf) => buf,
            None => {
                debug!(buffer_len = self.buffer_len, "frame pool exhausted, allocating");
                BytesMut::with_capacity(self.buffer_len)
            }
        };
        fill(&mut data);

        Frame {
            data,
            meta,
            captured_at,
            enqueued_at: None,
            pool: Some(self.free.clone()),
        }
    }
}
