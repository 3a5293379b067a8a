//! Presentation surface contract and scoped drawable acquisition.

use std::ops::{Deref, DerefMut};

use crate::detect::Point;
use crate::display::mapper::Size;
use crate::errors::RenderError;

/// Coordinates further than this many surface extents away are never drawn.
const MAX_COORD_FACTOR: f32 = 16.0;

/// Largest coordinate magnitude drawn on a `size` surface.
pub(crate) fn reach(size: Size) -> f32 {
    MAX_COORD_FACTOR * size.width.max(size.height) as f32
}

/// Whether `p` is finite and within [`reach`] of a `size` surface.
pub(crate) fn within_reach(p: Point, size: Size) -> bool {
    let limit = reach(size);
    p.is_finite() && p.x.abs() <= limit && p.y.abs() <= limit
}

/// Straight-alpha RGBA color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const TRANSPARENT: Color = Color::rgba(0, 0, 0, 0);
    pub const WHITE: Color = Color::rgba(255, 255, 255, 255);
    pub const GREEN: Color = Color::rgba(0, 255, 0, 255);
    pub const RED: Color = Color::rgba(255, 0, 0, 255);

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub const fn with_alpha(self, a: u8) -> Self {
        Self { a, ..self }
    }
}

/// Drawing operations available while a surface is locked.
pub trait OverlayCanvas {
    /// Replace every pixel with `color` (no blending).
    fn clear(&mut self, color: Color) -> Result<(), RenderError>;

    /// Fill a closed polygon, blending with what is underneath.
    fn fill_polygon(&mut self, points: &[Point], color: Color) -> Result<(), RenderError>;

    /// Stroke one segment `width` pixels wide.
    fn stroke_segment(&mut self, from: Point, to: Point, width: f32, color: Color) -> Result<(), RenderError>;

    /// Draw `text` centered on `center` with glyphs `height` pixels tall.
    fn draw_text(&mut self, text: &str, center: Point, height: f32, color: Color) -> Result<(), RenderError>;
}

/// Something the overlay can be drawn onto and presented.
///
/// `lock` and `unlock_and_post` always come in pairs; use [`Drawable::acquire`]
/// rather than calling them directly.
pub trait PresentationSurface: OverlayCanvas + Send {
    /// Current surface size, `None` while not laid out.
    fn size(&self) -> Option<Size>;

    /// Begin a drawing pass.
    fn lock(&mut self) -> Result<(), RenderError>;

    /// End the drawing pass and present what was drawn.
    fn unlock_and_post(&mut self);

    /// Resize the backing store.
    fn resize(&mut self, size: Size);
}

/// A locked surface; posting happens when the guard is dropped.
pub struct Drawable<'a, S: PresentationSurface + ?Sized> {
    surface: &'a mut S,
}

impl<'a, S: PresentationSurface + ?Sized> Drawable<'a, S> {
    /// Lock `surface`. On error nothing was locked and nothing needs releasing.
    pub fn acquire(surface: &'a mut S) -> Result<Self, RenderError> {
        surface.lock()?;
        Ok(Self { surface })
    }
}

impl<S: PresentationSurface + ?Sized> Deref for Drawable<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.surface
    }
}

impl<S: PresentationSurface + ?Sized> DerefMut for Drawable<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.surface
    }
}

impl<S: PresentationSurface + ?Sized> Drop for Drawable<'_, S> {
    fn drop(&mut self) {
        self.surface.unlock_and_post();
    }
}
