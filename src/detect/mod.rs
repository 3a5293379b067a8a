//! Tag detections and the contract of the (opaque) tag detector.
//!
//! The recognition algorithm itself lives outside this crate. Anything that
//! can turn a luma plane into [`Detection`]s implements [`TagDetector`]; the
//! detection worker is its only caller.

use serde::{Deserialize, Serialize};

use crate::errors::DetectorError;

/// Largest hamming correction the detector families support.
pub const MAX_HAMMING_LIMIT: u32 = 3;

/// A point in detector pixel space or display space.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// One recognised tag.
///
/// Corners wrap counter-clockwise around the tag starting from the family's
/// reference corner. Everything is in detector pixel space, i.e. the raw
/// buffer orientation.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub id: i32,
    /// Number of bits corrected while decoding the payload.
    pub hamming: u32,
    pub center: Point,
    pub corners: [Point; 4],
}

impl Detection {
    /// Build from the flattened `[x0 y0 x1 y1 ...]` layout native detectors emit.
    pub fn from_flat(id: i32, hamming: u32, center: [f64; 2], corners: [f64; 8]) -> Self {
        let p = |i: usize| Point::new(corners[2 * i] as f32, corners[2 * i + 1] as f32);
        Self {
            id,
            hamming,
            center: Point::new(center[0] as f32, center[1] as f32),
            corners: [p(0), p(1), p(2), p(3)],
        }
    }

    pub fn is_finite(&self) -> bool {
        self.center.is_finite() && self.corners.iter().all(Point::is_finite)
    }
}

/// Borrowed luma plane passed to the detector.
#[derive(Debug, Clone, Copy)]
pub struct LumaView<'a> {
    pub buffer: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub stride: u32,
}

impl LumaView<'_> {
    /// Check that every addressed pixel lies inside the buffer.
    pub fn validate(&self) -> Result<(), DetectorError> {
        let needed = if self.height == 0 {
            0
        } else {
            self.stride as usize * (self.height as usize - 1) + self.width as usize
        };
        if self.width == 0 || self.height == 0 || self.stride < self.width || self.buffer.len() < needed {
            return Err(DetectorError::InvalidImage {
                width: self.width,
                height: self.height,
                stride: self.stride,
                len: self.buffer.len(),
            });
        }
        Ok(())
    }
}

/// Detector configuration handed to [`TagDetector::init`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorParams {
    pub tag_family: String,
    pub max_hamming: u32,
    pub decimation: f32,
    pub blur_sigma: f32,
    /// Detector-internal threads; 0 means "use available parallelism".
    pub threads: usize,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            tag_family: "tag36h11".into(),
            max_hamming: 2,
            decimation: 2.0,
            blur_sigma: 0.0,
            threads: 0,
        }
    }
}

impl DetectorParams {
    /// Copy with `threads == 0` replaced by the machine's parallelism.
    pub fn resolved(&self) -> Self {
        let mut params = self.clone();
        if params.threads == 0 {
            params.threads = crate::utils::available_threads();
        }
        params
    }

    pub fn validate(&self) -> Result<(), DetectorError> {
        if self.tag_family.is_empty() {
            return Err(DetectorError::InvalidParams("tag family is empty".into()));
        }
        if self.max_hamming > MAX_HAMMING_LIMIT {
            return Err(DetectorError::InvalidParams(format!(
                "max hamming {} exceeds {MAX_HAMMING_LIMIT}",
                self.max_hamming
            )));
        }
        if !(self.decimation >= 1.0) {
            return Err(DetectorError::InvalidParams(format!(
                "decimation {} must be >= 1",
                self.decimation
            )));
        }
        if !(self.blur_sigma >= 0.0) {
            return Err(DetectorError::InvalidParams(format!(
                "blur sigma {} must be >= 0",
                self.blur_sigma
            )));
        }
        Ok(())
    }
}

/// Contract of the native tag detector.
///
/// Methods take `&mut self`: the detector is not re-entrant, and exclusive
/// ownership by the detection worker is what serialises `init` against
/// `detect`.
pub trait TagDetector: Send {
    /// (Re)configure. Must succeed before the first `detect`.
    fn init(&mut self, params: &DetectorParams) -> Result<(), DetectorError>;

    /// Detect tags in one luma plane.
    fn detect(&mut self, image: LumaView<'_>) -> Result<Vec<Detection>, DetectorError>;
}

impl<T: TagDetector + ?Sized> TagDetector for Box<T> {
    fn init(&mut self, params: &DetectorParams) -> Result<(), DetectorError> {
        (**self).init(params)
    }

    fn detect(&mut self, image: LumaView<'_>) -> Result<Vec<Detection>, DetectorError> {
        (**self).detect(image)
    }
}

/// Detector that never finds anything; stands in when no native binding is linked.
#[derive(Debug, Default)]
pub struct NullDetector {
    params: Option<DetectorParams>,
}

impl NullDetector {
    pub fn params(&self) -> Option<&DetectorParams> {
        self.params.as_ref()
    }
}

impl TagDetector for NullDetector {
    fn init(&mut self, params: &DetectorParams) -> Result<(), DetectorError> {
        params.validate()?;
        self.params = Some(params.clone());
        Ok(())
    }

    fn detect(&mut self, image: LumaView<'_>) -> Result<Vec<Detection>, DetectorError> {
        if self.params.is_none() {
            return Err(DetectorError::NotInitialised);
        }
        image.validate()?;
        Ok(Vec::new())
    }
}
