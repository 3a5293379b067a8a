pub mod glyphs;
pub mod mapper;
pub mod raster;
pub mod renderer;
pub mod surface;

pub use mapper::{CoordinateMapper, Facing, Geometry, MappedDetection, Rotation, Size, Transform};
pub use raster::{PresentedOverlay, RasterSurface};
pub use renderer::{DetectionSet, OverlayStyle, RenderOutcome, RenderStats, Renderer};
pub use surface::{Color, Drawable, OverlayCanvas, PresentationSurface};
