//! In-memory RGBA overlay surface drawn with `imageproc`.
//!
//! The back buffer is drawn between `lock` and `unlock_and_post`; posting
//! publishes a copy through an [`ArcSwap`] so any thread can read the last
//! presented overlay without touching the renderer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_line_segment_mut, draw_polygon_mut, Blend};
use imageproc::point::Point as PixelPoint;
use imageproc::rect::Rect;
use tracing::warn;

use crate::detect::Point;
use crate::display::glyphs;
use crate::display::mapper::Size;
use crate::display::surface::{reach, within_reach, Color, OverlayCanvas, PresentationSurface};
use crate::errors::RenderError;

/// Shared view of the last presented overlay.
pub type PresentedOverlay = Arc<ArcSwap<RgbaImage>>;

pub struct RasterSurface {
    back: RgbaImage,
    front: PresentedOverlay,
    lost: Arc<AtomicBool>,
    locked: bool,
    presented: u64,
}

impl RasterSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            back: RgbaImage::new(width, height),
            front: Arc::new(ArcSwap::from_pointee(RgbaImage::new(width, height))),
            lost: Arc::new(AtomicBool::new(false)),
            locked: false,
            presented: 0,
        }
    }

    /// Handle to the last presented overlay.
    pub fn presented(&self) -> PresentedOverlay {
        self.front.clone()
    }

    /// Flag that makes `lock` fail with [`RenderError::SurfaceLost`] while set.
    pub fn lost_flag(&self) -> Arc<AtomicBool> {
        self.lost.clone()
    }

    /// Number of completed presents.
    pub fn present_count(&self) -> u64 {
        self.presented
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    fn ensure_locked(&self) -> Result<(), RenderError> {
        if self.locked {
            Ok(())
        } else {
            Err(RenderError::Draw("surface is not locked".into()))
        }
    }

    fn extent(&self) -> Size {
        Size::new(self.back.width(), self.back.height())
    }

    /// Round to pixel space, dropping repeated vertices.
    fn to_polygon(&self, points: &[Point]) -> Result<Vec<PixelPoint<i32>>, RenderError> {
        let extent = self.extent();
        let mut poly: Vec<PixelPoint<i32>> = Vec::with_capacity(points.len());
        for p in points {
            if !within_reach(*p, extent) {
                return Err(RenderError::Draw(format!("vertex out of range: {p:?}")));
            }
            let q = PixelPoint::new(p.x.round() as i32, p.y.round() as i32);
            if poly.last() != Some(&q) {
                poly.push(q);
            }
        }
        while poly.len() > 1 && poly.first() == poly.last() {
            poly.pop();
        }
        Ok(poly)
    }
}

fn rgba(color: Color) -> Rgba<u8> {
    Rgba([color.r, color.g, color.b, color.a])
}

impl OverlayCanvas for RasterSurface {
    fn clear(&mut self, color: Color) -> Result<(), RenderError> {
        self.ensure_locked()?;
        let pixel = rgba(color);
        for p in self.back.pixels_mut() {
            *p = pixel;
        }
        Ok(())
    }

    fn fill_polygon(&mut self, points: &[Point], color: Color) -> Result<(), RenderError> {
        self.ensure_locked()?;
        let poly = self.to_polygon(points)?;
        if poly.len() < 3 {
            return Err(RenderError::Draw(format!(
                "degenerate polygon with {} distinct vertices",
                poly.len()
            )));
        }

        let mut canvas = Blend(std::mem::take(&mut self.back));
        draw_polygon_mut(&mut canvas, &poly, rgba(color));
        self.back = canvas.0;
        Ok(())
    }

    fn stroke_segment(&mut self, from: Point, to: Point, width: f32, color: Color) -> Result<(), RenderError> {
        self.ensure_locked()?;
        let (dx, dy) = (to.x - from.x, to.y - from.y);
        let len = (dx * dx + dy * dy).sqrt();
        let half = width.max(1.0) / 2.0;

        let quad = if len > f32::EPSILON {
            let (nx, ny) = (-dy / len * half, dx / len * half);
            self.to_polygon(&[
                Point::new(from.x + nx, from.y + ny),
                Point::new(to.x + nx, to.y + ny),
                Point::new(to.x - nx, to.y - ny),
                Point::new(from.x - nx, from.y - ny),
            ])?
        } else {
            self.to_polygon(&[from, to])?
        };

        if quad.len() >= 3 {
            draw_polygon_mut(&mut self.back, &quad, rgba(color));
        } else {
            draw_line_segment_mut(&mut self.back, (from.x, from.y), (to.x, to.y), rgba(color));
        }
        Ok(())
    }

    fn draw_text(&mut self, text: &str, center: Point, height: f32, color: Color) -> Result<(), RenderError> {
        self.ensure_locked()?;
        let extent = self.extent();
        if !within_reach(center, extent) || !(height > 0.0 && height <= reach(extent)) {
            return Err(RenderError::Draw(format!(
                "text anchor {center:?} or height {height} out of range"
            )));
        }
        let cells = glyphs::layout(text, center.x, center.y, height)
            .ok_or_else(|| RenderError::Draw(format!("no glyph for text {text:?}")))?;

        let pixel = rgba(color);
        let (w, h) = (extent.width as f32, extent.height as f32);
        for cell in cells {
            // Cells entirely off the buffer are skipped.
            if cell.x >= w || cell.y >= h || cell.x + cell.size <= 0.0 || cell.y + cell.size <= 0.0 {
                continue;
            }
            let side = cell.size.ceil().max(1.0) as u32;
            let rect = Rect::at(cell.x.round() as i32, cell.y.round() as i32).of_size(side, side);
            draw_filled_rect_mut(&mut self.back, rect, pixel);
        }
        Ok(())
    }
}

impl PresentationSurface for RasterSurface {
    fn size(&self) -> Option<Size> {
        let size = self.extent();
        (!size.is_empty()).then_some(size)
    }

    fn lock(&mut self) -> Result<(), RenderError> {
        if self.lost.load(Ordering::Acquire) || self.size().is_none() {
            return Err(RenderError::SurfaceLost);
        }
        if self.locked {
            return Err(RenderError::Draw("surface already locked".into()));
        }
        self.locked = true;
        Ok(())
    }

    fn unlock_and_post(&mut self) {
        if !self.locked {
            warn!("unlock_and_post on a surface that is not locked");
            return;
        }
        self.locked = false;
        self.front.store(Arc::new(self.back.clone()));
        self.presented += 1;
    }

    fn resize(&mut self, size: Size) {
        self.back = RgbaImage::new(size.width, size.height);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::surface::Drawable;

    #[test]
    fn test_lock_requires_size_and_presence() {
        let mut surface = RasterSurface::new(0, 0);
        assert!(matches!(surface.lock(), Err(RenderError::SurfaceLost)));

        surface.resize(Size::new(8, 8));
        let lost = surface.lost_flag();
        lost.store(true, Ordering::Release);
        assert!(matches!(surface.lock(), Err(RenderError::SurfaceLost)));

        lost.store(false, Ordering::Release);
        assert!(surface.lock().is_ok());
        assert!(surface.lock().is_err());
        surface.unlock_and_post();
        assert_eq!(surface.present_count(), 1);
    }

    #[test]
    fn test_drawable_posts_on_drop() {
        let mut surface = RasterSurface::new(16, 16);
        let overlay = surface.presented();
        {
            let mut drawable = Drawable::acquire(&mut surface).unwrap();
            drawable.clear(Color::RED).unwrap();
        }
        assert!(!surface.is_locked());
        assert_eq!(overlay.load().get_pixel(3, 3), &Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn test_translucent_fill_over_transparent() {
        let mut surface = RasterSurface::new(20, 20);
        let overlay = surface.presented();
        {
            let mut d = Drawable::acquire(&mut surface).unwrap();
            d.clear(Color::TRANSPARENT).unwrap();
            d.fill_polygon(
                &[
                    Point::new(2.0, 2.0),
                    Point::new(17.0, 2.0),
                    Point::new(17.0, 17.0),
                    Point::new(2.0, 17.0),
                ],
                Color::GREEN.with_alpha(128),
            )
            .unwrap();
        }
        let overlay = overlay.load();
        let inside = overlay.get_pixel(10, 10);
        assert!(inside[1] >= 254);
        assert!((127..=129).contains(&inside[3]));
        assert_eq!(overlay.get_pixel(0, 0)[3], 0);
    }

    #[test]
    fn test_rejects_degenerate_and_wild_geometry() {
        let mut surface = RasterSurface::new(20, 20);
        let mut d = Drawable::acquire(&mut surface).unwrap();
        let collapsed = [Point::new(5.0, 5.0); 4];
        assert!(d.fill_polygon(&collapsed, Color::WHITE).is_err());

        let wild = [
            Point::new(0.0, 0.0),
            Point::new(f32::NAN, 1.0),
            Point::new(3.0, 3.0),
        ];
        assert!(d.fill_polygon(&wild, Color::WHITE).is_err());

        let far = [
            Point::new(0.0, 0.0),
            Point::new(1e9, 0.0),
            Point::new(0.0, 5.0),
        ];
        assert!(d.fill_polygon(&far, Color::WHITE).is_err());

        assert!(d.draw_text("7", Point::new(1e10, 10.0), 10.0, Color::WHITE).is_err());
        assert!(d.draw_text("7", Point::new(10.0, 10.0), f32::INFINITY, Color::WHITE).is_err());
    }

    #[test]
    fn test_text_partly_off_buffer() {
        let mut surface = RasterSurface::new(32, 32);
        let overlay = surface.presented();
        {
            let mut d = Drawable::acquire(&mut surface).unwrap();
            d.clear(Color::TRANSPARENT).unwrap();
            d.draw_text("88", Point::new(-4.0, 16.0), 10.0, Color::WHITE).unwrap();
        }
        // Right half of the second digit lands on the buffer.
        let overlay = overlay.load();
        assert!((0..32).any(|y| overlay.get_pixel(1, y)[3] == 255));
    }

    #[test]
    fn test_thick_stroke_and_text() {
        let mut surface = RasterSurface::new(64, 64);
        let overlay = surface.presented();
        {
            let mut d = Drawable::acquire(&mut surface).unwrap();
            d.clear(Color::TRANSPARENT).unwrap();
            d.stroke_segment(Point::new(4.0, 32.0), Point::new(60.0, 32.0), 10.0, Color::RED)
                .unwrap();
            d.draw_text("1", Point::new(32.0, 10.0), 10.0, Color::WHITE).unwrap();
        }
        let overlay = overlay.load();
        assert_eq!(overlay.get_pixel(30, 28), &Rgba([255, 0, 0, 255]));
        assert_eq!(overlay.get_pixel(30, 36), &Rgba([255, 0, 0, 255]));
        assert_eq!(overlay.get_pixel(30, 45)[3], 0);
        // Center column of "1" is lit.
        assert_eq!(overlay.get_pixel(32, 10), &Rgba([255, 255, 255, 255]));
    }
}
