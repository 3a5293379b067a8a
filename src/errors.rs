//! Error taxonomy for the frame pipeline.
//!
//! Only [`PipelineError`] ever reaches the caller of `Pipeline::start`; the
//! other errors are recovered where they happen and only show up in logs and
//! statistics.

use thiserror::Error;

use crate::pipeline::PipelineState;

/// Errors surfaced by the pipeline lifecycle entry points.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The frame source could not be acquired. Fatal to `start`, never retried.
    #[error("frame source unavailable")]
    HardwareUnavailable(#[source] SourceError),

    #[error("detector initialisation failed")]
    DetectorInit(#[source] DetectorError),

    #[error("failed to spawn detection worker")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("operation not allowed while pipeline is {state:?}")]
    InvalidState { state: PipelineState },

    #[error(transparent)]
    Settings(#[from] SettingsError),
}

/// Errors raised by a frame source while acquiring or streaming.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("capture device {path:?} could not be opened")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("capture device does not support {0}")]
    Unsupported(String),

    #[error("frame source is already streaming")]
    AlreadyStarted,

    #[error("failed to spawn capture thread")]
    Spawn(#[source] std::io::Error),
}

/// Errors raised by the detector contract.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("detection failed: {0}")]
    Failed(String),

    #[error("luma view {width}x{height} (stride {stride}) does not fit a {len} byte buffer")]
    InvalidImage {
        width: u32,
        height: u32,
        stride: u32,
        len: usize,
    },

    #[error("invalid detector parameters: {0}")]
    InvalidParams(String),

    #[error("detector used before init")]
    NotInitialised,
}

/// Errors raised while drawing one render pass.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("presentation surface lost")]
    SurfaceLost,

    #[error("malformed detection for tag {id}: {reason}")]
    MalformedDetection { id: i32, reason: &'static str },

    #[error("draw call failed: {0}")]
    Draw(String),
}

/// Errors raised while loading or validating settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}
