//! Overlay renderer: draws the latest detection set in display coordinates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use arc_swap::ArcSwapOption;
use tracing::{debug, instrument, trace, warn};

use crate::detect::Detection;
use crate::display::mapper::{CoordinateMapper, Size, Transform};
use crate::display::surface::{within_reach, Color, Drawable, OverlayCanvas, PresentationSurface};
use crate::errors::RenderError;

/// Visual style of the overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayStyle {
    pub fill: Color,
    /// Border color per edge, keyed by the index of the edge's first corner.
    pub borders: [Color; 4],
    pub border_width: f32,
    pub text_color: Color,
    pub text_height: f32,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            fill: Color::GREEN.with_alpha(128),
            borders: [Color::GREEN, Color::WHITE, Color::WHITE, Color::RED],
            border_width: 10.0,
            text_color: Color::WHITE,
            text_height: 100.0,
        }
    }
}

/// Detections produced from one frame.
#[derive(Debug, Clone)]
pub struct DetectionSet {
    pub sequence: u64,
    pub detections: Vec<Detection>,
    pub completed_at: Instant,
}

/// What one call to [`Renderer::render_pending`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// Nothing new to draw.
    Idle,
    /// The pass ran; `failed` detections could not be drawn.
    Rendered { drawn: usize, failed: usize },
    /// Display geometry is not known yet; the set was dropped.
    Deferred,
    /// The surface could not be locked; the pass was skipped.
    SurfaceLost,
}

/// Renderer counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RenderStats {
    pub submitted: u64,
    pub superseded: u64,
    pub rendered: u64,
    pub deferred: u64,
    pub surface_lost: u64,
    pub draw_failures: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    superseded: AtomicU64,
    rendered: AtomicU64,
    deferred: AtomicU64,
    surface_lost: AtomicU64,
    draw_failures: AtomicU64,
}

/// Latest-only overlay renderer.
///
/// Detection sets are never queued: [`submit`](Self::submit) replaces any set
/// that has not started rendering yet, and [`render_pending`](Self::render_pending)
/// consumes the current one exactly once. Rendering may be driven from the
/// detection worker or from a presentation callback on another thread.
pub struct Renderer {
    pending: ArcSwapOption<DetectionSet>,
    surface: Mutex<Box<dyn PresentationSurface>>,
    mapper: Arc<CoordinateMapper>,
    style: OverlayStyle,
    stats: Counters,
}

impl Renderer {
    /// Wrap `surface`, publishing its size (if laid out) to `mapper`.
    pub fn new<S>(surface: S, mapper: Arc<CoordinateMapper>) -> Self
    where
        S: PresentationSurface + 'static,
    {
        if let Some(size) = surface.size() {
            mapper.set_destination_size(size.width, size.height);
        }
        Self {
            pending: ArcSwapOption::empty(),
            surface: Mutex::new(Box::new(surface)),
            mapper,
            style: OverlayStyle::default(),
            stats: Counters::default(),
        }
    }

    pub fn with_style(mut self, style: OverlayStyle) -> Self {
        self.style = style;
        self
    }

    pub fn mapper(&self) -> &Arc<CoordinateMapper> {
        &self.mapper
    }

    /// Offer a new set, discarding any set still waiting to be drawn.
    pub fn submit(&self, set: DetectionSet) {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        if let Some(previous) = self.pending.swap(Some(Arc::new(set))) {
            self.stats.superseded.fetch_add(1, Ordering::Relaxed);
            trace!(sequence = previous.sequence, "detection set superseded before render");
        }
    }

    /// Whether a set is waiting to be drawn.
    pub fn has_pending(&self) -> bool {
        self.pending.load().is_some()
    }

    /// Resize the surface and the mapper's destination together.
    pub fn resize(&self, width: u32, height: u32) {
        self.lock_surface().resize(Size::new(width, height));
        self.mapper.set_destination_size(width, height);
    }

    fn lock_surface(&self) -> std::sync::MutexGuard<'_, Box<dyn PresentationSurface>> {
        self.surface.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Draw the pending set, if any.
    ///
    /// Never fails: a lost surface skips the pass, a detection that cannot be
    /// drawn is logged and skipped, and the surface is always posted once it
    /// was locked.
    #[instrument(level = "trace", skip(self))]
    pub fn render_pending(&self) -> RenderOutcome {
        let Some(set) = self.pending.swap(None) else {
            return RenderOutcome::Idle;
        };

        let Some(transform) = self.mapper.transform() else {
            self.stats.deferred.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("tagview_renders_skipped_total").increment(1);
            debug!(
                sequence = set.sequence,
                detections = set.detections.len(),
                "display geometry not resolved, dropping detections"
            );
            return RenderOutcome::Deferred;
        };

        let render_start = Instant::now();
        let mut surface = self.lock_surface();
        let mut drawable = match Drawable::acquire(&mut **surface) {
            Ok(drawable) => drawable,
            Err(err) => {
                self.stats.surface_lost.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("tagview_renders_skipped_total").increment(1);
                warn!(sequence = set.sequence, error = %err, "skipping render pass");
                return RenderOutcome::SurfaceLost;
            }
        };

        if let Err(err) = drawable.clear(Color::TRANSPARENT) {
            warn!(sequence = set.sequence, error = %err, "failed to clear overlay");
        }

        let bounds = drawable.size();
        let mut failed = 0;
        for detection in &set.detections {
            if let Err(err) = draw_detection(&mut *drawable, &transform, bounds, detection, &self.style) {
                failed += 1;
                warn!(
                    sequence = set.sequence,
                    id = detection.id,
                    error = %err,
                    "failed to draw detection"
                );
            }
        }
        drop(drawable);

        self.stats.rendered.fetch_add(1, Ordering::Relaxed);
        self.stats
            .draw_failures
            .fetch_add(failed as u64, Ordering::Relaxed);
        metrics::histogram!("tagview_render_time_us").record(render_start.elapsed().as_micros() as f64);

        RenderOutcome::Rendered {
            drawn: set.detections.len() - failed,
            failed,
        }
    }

    pub fn stats(&self) -> RenderStats {
        RenderStats {
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            superseded: self.stats.superseded.load(Ordering::Relaxed),
            rendered: self.stats.rendered.load(Ordering::Relaxed),
            deferred: self.stats.deferred.load(Ordering::Relaxed),
            surface_lost: self.stats.surface_lost.load(Ordering::Relaxed),
            draw_failures: self.stats.draw_failures.load(Ordering::Relaxed),
        }
    }
}

fn draw_detection<C>(
    canvas: &mut C,
    transform: &Transform,
    bounds: Option<Size>,
    detection: &Detection,
    style: &OverlayStyle,
) -> Result<(), RenderError>
where
    C: OverlayCanvas + ?Sized,
{
    if !detection.is_finite() {
        return Err(RenderError::MalformedDetection {
            id: detection.id,
            reason: "non-finite coordinates",
        });
    }

    let mapped = transform.map_detection(detection);
    if let Some(bounds) = bounds {
        let mut points = mapped.corners.iter().chain(std::iter::once(&mapped.center));
        if !points.all(|p| within_reach(*p, bounds)) {
            return Err(RenderError::MalformedDetection {
                id: detection.id,
                reason: "maps outside the drawable range",
            });
        }
    }
    canvas.fill_polygon(&mapped.corners, style.fill)?;

    for (i, color) in style.borders.iter().enumerate() {
        let from = mapped.corners[i];
        let to = mapped.corners[(i + 1) % 4];
        canvas.stroke_segment(from, to, style.border_width, *color)?;
    }

    canvas.draw_text(&detection.id.to_string(), mapped.center, style.text_height, style.text_color)
}
