//! Real-time fiducial tag overlay pipeline.
//!
//! Frames flow from a [`FrameSource`](capture::FrameSource) through a bounded
//! [`FrameQueue`](pipeline::FrameQueue) to one detection worker, whose results
//! are mapped into display space and drawn by the [`Renderer`](display::Renderer).

pub mod capture;
pub mod detect;
pub mod display;
pub mod errors;
pub mod pipeline;
pub mod settings;
pub mod utils;

pub use errors::{DetectorError, PipelineError, RenderError, SettingsError, SourceError};
pub use pipeline::{Pipeline, PipelineEvent, PipelineState, PipelineStats};
pub use settings::Settings;
