use std::io;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

/// Worker threads to use when the detector is configured with `threads = 0`.
pub fn available_threads() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Spawn a named OS thread.
pub fn spawn_named<F>(name: &str, f: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name.to_owned()).spawn(f)
}

/// Pin the calling thread to `core`. Returns whether pinning succeeded.
pub fn pin_current_thread(core: usize) -> bool {
    let Some(ids) = core_affinity::get_core_ids() else {
        warn!(core, "core affinity is not supported on this platform");
        return false;
    };
    match ids.into_iter().find(|id| id.id == core) {
        Some(id) if core_affinity::set_for_current(id) => {
            debug!(core, "thread pinned");
            true
        }
        Some(_) => {
            warn!(core, "failed to pin thread");
            false
        }
        None => {
            warn!(core, "no such core, thread left unpinned");
            false
        }
    }
}

/// Probe `/dev/video0..9` for the first capture device offering YUYV.
#[cfg(feature = "v4l2")]
pub fn auto_detect_device() -> Result<String, crate::errors::SourceError> {
    use std::path::Path;

    use tracing::info;
    use v4l::{capability::Flags, video::Capture, Device, FourCC};

    info!("auto-detecting capture devices");

    for i in 0..10 {
        let path = format!("/dev/video{i}");
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }
        let Ok(formats) = dev.enum_formats() else {
            continue;
        };
        if formats.iter().any(|fmt| fmt.fourcc == FourCC::new(b"YUYV")) {
            info!(device = %path, card = %caps.card, "found YUYV capture device");
            return Ok(path);
        }
    }

    Err(crate::errors::SourceError::Unsupported(
        "auto-detection: no YUYV capture device found".into(),
    ))
}
