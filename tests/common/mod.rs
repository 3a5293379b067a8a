#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tagview::capture::{Frame, FrameMetadata, FrameSource, PixelFormat};
use tagview::detect::{Detection, DetectorParams, LumaView, TagDetector};
use tagview::errors::{DetectorError, SourceError};
use tagview::pipeline::FrameSink;
use tagview::settings::CaptureSettings;
use tagview::Settings;

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 48;

pub fn frame(sequence: u64) -> Frame {
    let meta = FrameMetadata {
        sequence,
        width: WIDTH,
        height: HEIGHT,
        stride: WIDTH,
        format: PixelFormat::Gray8,
    };
    Frame::new(BytesMut::zeroed((WIDTH * HEIGHT) as usize), meta, Instant::now())
}

pub fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.capture.width = WIDTH;
    settings.capture.height = HEIGHT;
    settings.capture.sensor_orientation = 0;
    settings.display.width = WIDTH;
    settings.display.height = HEIGHT;
    settings.detector.threads = 1;
    settings
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Test-side handle of a [`ManualSource`].
#[derive(Clone, Default)]
pub struct SourceControl {
    sink: Arc<Mutex<Option<FrameSink>>>,
    pub starts: Arc<AtomicUsize>,
    pub stops: Arc<AtomicUsize>,
    fail: Arc<Mutex<bool>>,
}

impl SourceControl {
    /// Deliver a frame the way a camera callback would.
    pub fn deliver(&self, frame: Frame) -> bool {
        match self.sink.lock().unwrap().as_ref() {
            Some(sink) => sink.deliver(frame),
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.sink.lock().unwrap().is_some()
    }

    pub fn fail_acquisition(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

/// Frame source driven by the test thread.
pub struct ManualSource {
    control: SourceControl,
}

impl ManualSource {
    pub fn new() -> (Self, SourceControl) {
        let control = SourceControl::default();
        (
            Self {
                control: control.clone(),
            },
            control,
        )
    }
}

impl FrameSource for ManualSource {
    fn start(&mut self, _settings: &CaptureSettings, sink: FrameSink) -> Result<(), SourceError> {
        if *self.control.fail.lock().unwrap() {
            return Err(SourceError::Open {
                path: "/dev/video-test".into(),
                source: io::Error::new(io::ErrorKind::PermissionDenied, "camera permission denied"),
            });
        }
        self.control.starts.fetch_add(1, Ordering::SeqCst);
        *self.control.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn stop(&mut self) {
        if self.control.sink.lock().unwrap().take().is_some() {
            self.control.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn name(&self) -> &str {
        "manual"
    }
}

/// What a [`ScriptedDetector`] observed.
#[derive(Default)]
pub struct DetectorLog {
    pub inits: Vec<DetectorParams>,
    pub detects: usize,
}

/// Detector whose behaviour is set up by the test.
pub struct ScriptedDetector {
    pub log: Arc<Mutex<DetectorLog>>,
    /// 1-based detect calls that fail.
    pub fail_on: Vec<usize>,
    pub fail_init: bool,
    /// Tag family that `init` refuses.
    pub reject_family: Option<String>,
    /// While set, `detect` blocks until the sender is dropped.
    pub gate: Option<flume::Receiver<()>>,
    /// Signalled when `detect` is entered.
    pub entered: Option<flume::Sender<usize>>,
}

impl ScriptedDetector {
    pub fn new() -> (Self, Arc<Mutex<DetectorLog>>) {
        let log = Arc::new(Mutex::new(DetectorLog::default()));
        (
            Self {
                log: log.clone(),
                fail_on: Vec::new(),
                fail_init: false,
                reject_family: None,
                gate: None,
                entered: None,
            },
            log,
        )
    }
}

impl TagDetector for ScriptedDetector {
    fn init(&mut self, params: &DetectorParams) -> Result<(), DetectorError> {
        if self.fail_init || self.reject_family.as_deref() == Some(params.tag_family.as_str()) {
            return Err(DetectorError::InvalidParams("unknown tag family".into()));
        }
        self.log.lock().unwrap().inits.push(params.clone());
        Ok(())
    }

    fn detect(&mut self, _image: LumaView<'_>) -> Result<Vec<Detection>, DetectorError> {
        let call = {
            let mut log = self.log.lock().unwrap();
            log.detects += 1;
            log.detects
        };
        if let Some(entered) = &self.entered {
            let _ = entered.send(call);
        }
        if let Some(gate) = &self.gate {
            // Returns once the test drops the sender.
            let _ = gate.recv();
        }
        if self.fail_on.contains(&call) {
            return Err(DetectorError::Failed(format!("scripted failure on call {call}")));
        }
        Ok(vec![Detection::from_flat(
            7,
            0,
            [32.0, 24.0],
            [22.0, 34.0, 42.0, 34.0, 42.0, 14.0, 22.0, 14.0],
        )])
    }
}
