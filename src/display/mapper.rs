//! Mapping from detector pixel space to display space.
//!
//! # Convention
//!
//! Detector points are always in raw buffer orientation. A [`Transform`]
//! applies, in this order:
//!
//! 1. a clockwise quarter-turn rotation about the source extent
//!    (90°: `(x, y) -> (h - y, x)`),
//! 2. a uniform cover scale (`max(dw / rw, dh / rh)`) with centered offsets,
//!    so the image always fills the display and overflow is cropped,
//! 3. an optional horizontal mirror about the display width (front sensors).
//!
//! No other axis swaps happen anywhere in the crate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::detect::{Detection, Point};

/// Which way the sensor faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    #[default]
    Back,
    Front,
}

/// Clockwise quarter-turn rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Snap arbitrary degrees to the nearest quarter turn.
    pub fn from_degrees(degrees: i32) -> Self {
        let normalized = degrees.rem_euclid(360);
        match ((normalized + 45) / 90) % 4 {
            0 => Rotation::Deg0,
            1 => Rotation::Deg90,
            2 => Rotation::Deg180,
            _ => Rotation::Deg270,
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// Rotation from sensor to display for a sensor mounted at
    /// `sensor_orientation` degrees on a device rotated by `device_rotation`.
    pub fn for_display(sensor_orientation: u32, device_rotation: u32, facing: Facing) -> Self {
        // Reduced first so the cast and the sum cannot overflow.
        let sensor = (sensor_orientation % 360) as i32;
        let device = (device_rotation % 360) as i32;
        let degrees = match facing {
            Facing::Back => sensor - device,
            Facing::Front => sensor + device,
        };
        Self::from_degrees(degrees)
    }

    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }

    fn apply(self, p: Point, width: f32, height: f32) -> Point {
        match self {
            Rotation::Deg0 => p,
            Rotation::Deg90 => Point::new(height - p.y, p.x),
            Rotation::Deg180 => Point::new(width - p.x, height - p.y),
            Rotation::Deg270 => Point::new(p.y, width - p.x),
        }
    }
}

/// Pixel extent of a frame or a display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    fn packed(&self) -> u64 {
        (u64::from(self.width) << 32) | u64::from(self.height)
    }
}

/// Immutable rotation, scale, offset and mirror composition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    rotation: Rotation,
    source_width: f32,
    source_height: f32,
    scale_x: f32,
    scale_y: f32,
    offset_x: f32,
    offset_y: f32,
    mirror_width: Option<f32>,
}

impl Transform {
    /// 0° rotation, unit scale, zero offset, no mirror.
    pub fn identity() -> Self {
        Self {
            rotation: Rotation::Deg0,
            source_width: 0.0,
            source_height: 0.0,
            scale_x: 1.0,
            scale_y: 1.0,
            offset_x: 0.0,
            offset_y: 0.0,
            mirror_width: None,
        }
    }

    /// Compose the mapping from `source` pixels onto a `destination` display.
    ///
    /// Returns `None` while either extent is empty.
    pub fn compose(rotation: Rotation, source: Size, destination: Size, mirror: bool) -> Option<Self> {
        if source.is_empty() || destination.is_empty() {
            return None;
        }

        let (sw, sh) = (source.width as f32, source.height as f32);
        let (dw, dh) = (destination.width as f32, destination.height as f32);
        let (rw, rh) = if rotation.swaps_axes() { (sh, sw) } else { (sw, sh) };

        let scale = (dw / rw).max(dh / rh);

        Some(Self {
            rotation,
            source_width: sw,
            source_height: sh,
            scale_x: scale,
            scale_y: scale,
            offset_x: (dw - rw * scale) / 2.0,
            offset_y: (dh - rh * scale) / 2.0,
            mirror_width: mirror.then_some(dw),
        })
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn scale(&self) -> (f32, f32) {
        (self.scale_x, self.scale_y)
    }

    pub fn offset(&self) -> (f32, f32) {
        (self.offset_x, self.offset_y)
    }

    pub fn is_mirrored(&self) -> bool {
        self.mirror_width.is_some()
    }

    pub fn apply(&self, p: Point) -> Point {
        let r = self.rotation.apply(p, self.source_width, self.source_height);
        let x = r.x * self.scale_x + self.offset_x;
        let y = r.y * self.scale_y + self.offset_y;
        match self.mirror_width {
            Some(width) => Point::new(width - x, y),
            None => Point::new(x, y),
        }
    }

    /// Map a detection's corners and center into display space.
    pub fn map_detection(&self, detection: &Detection) -> MappedDetection {
        MappedDetection {
            id: detection.id,
            center: self.apply(detection.center),
            corners: detection.corners.map(|c| self.apply(c)),
        }
    }
}

/// A detection in display coordinates. Corner order is preserved from the source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MappedDetection {
    pub id: i32,
    pub center: Point,
    pub corners: [Point; 4],
}

/// Inputs that determine the current transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    pub source: Option<Size>,
    pub destination: Option<Size>,
    pub rotation: Rotation,
    pub mirror: bool,
}

/// Caches the transform for the current geometry.
///
/// Geometry changes may arrive on any thread; each one publishes a complete
/// new [`Transform`] through an atomic pointer swap, so readers never see a
/// half-updated value. Nothing is recomputed unless an input actually changed.
pub struct CoordinateMapper {
    geometry: Mutex<Geometry>,
    current: ArcSwapOption<Transform>,
    known_source: AtomicU64,
    recomputes: AtomicU64,
}

impl CoordinateMapper {
    pub fn new(rotation: Rotation, mirror: bool) -> Self {
        Self {
            geometry: Mutex::new(Geometry {
                rotation,
                mirror,
                ..Default::default()
            }),
            current: ArcSwapOption::empty(),
            known_source: AtomicU64::new(0),
            recomputes: AtomicU64::new(0),
        }
    }

    /// Current transform, or `None` while source or destination is unknown.
    pub fn transform(&self) -> Option<Arc<Transform>> {
        self.current.load_full()
    }

    pub fn geometry(&self) -> Geometry {
        *self.geometry.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Number of times a transform has been recomputed.
    pub fn recompute_count(&self) -> u64 {
        self.recomputes.load(Ordering::Relaxed)
    }

    /// Apply a geometry change. Returns whether anything changed.
    pub fn update<F>(&self, change: F) -> bool
    where
        F: FnOnce(&mut Geometry),
    {
        let mut geometry = self.geometry.lock().unwrap_or_else(|p| p.into_inner());
        let previous = *geometry;
        change(&mut geometry);
        if *geometry == previous {
            return false;
        }

        let next = match (geometry.source, geometry.destination) {
            (Some(source), Some(destination)) => {
                Transform::compose(geometry.rotation, source, destination, geometry.mirror)
            }
            _ => None,
        };
        self.known_source.store(
            geometry.source.map(|s| s.packed()).unwrap_or(0),
            Ordering::Release,
        );
        self.recomputes.fetch_add(1, Ordering::Relaxed);
        debug!(
            ?geometry,
            resolved = next.is_some(),
            "display geometry changed"
        );
        self.current.store(next.map(Arc::new));
        true
    }

    /// Record the frame extent; a no-op unless it differs from the last one.
    pub fn set_source_size(&self, width: u32, height: u32) -> bool {
        let size = Size::new(width, height);
        if self.known_source.load(Ordering::Acquire) == size.packed() {
            return false;
        }
        self.update(|g| g.source = Some(size))
    }

    pub fn set_destination_size(&self, width: u32, height: u32) -> bool {
        self.update(|g| g.destination = Some(Size::new(width, height)))
    }

    pub fn set_rotation(&self, rotation: Rotation) -> bool {
        self.update(|g| g.rotation = rotation)
    }

    pub fn set_mirror(&self, mirror: bool) -> bool {
        self.update(|g| g.mirror = mirror)
    }
}
