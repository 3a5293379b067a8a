use crate::errors::SourceError;
use crate::pipeline::FrameSink;
use crate::settings::CaptureSettings;

/// Contract of a camera or other frame producer.
///
/// `start` acquires the device and begins delivering frames to `sink` from a
/// context the source owns. Frames must be handed over promptly; buffers are
/// recycled when the pipeline drops them. `stop` releases the device and must
/// not return while a delivery is still in progress.
pub trait FrameSource: Send {
    fn start(&mut self, settings: &CaptureSettings, sink: FrameSink) -> Result<(), SourceError>;

    fn stop(&mut self);

    fn name(&self) -> &str;
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn start(&mut self, settings: &CaptureSettings, sink: FrameSink) -> Result<(), SourceError> {
        (**self).start(settings, sink)
    }

    fn stop(&mut self) {
        (**self).stop()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
