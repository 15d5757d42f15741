//! Rendering backends
//!
//! Every backend implements [`RenderBackend`]; the coordinator holds exactly
//! one of them as a trait object and swaps it on device loss or fallback.

pub mod blend;
mod cpu;
#[cfg(feature = "gpu")]
pub mod gpu;
mod pixels;
pub mod raster;

pub use cpu::{CpuBackend, CpuProvider};
pub use pixels::{Color, CompositionBuffer, DirtyRect, PixelBuffer};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::brush::{StrokeGeometry, StrokeMode, StrokeRecord};
use crate::core::errors::EngineResult;
use crate::layer::Layer;

/// Backend tiers, most capable first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    WebGpu,
    WebGl,
    Canvas2d,
}

impl BackendKind {
    /// Probe order
    pub const ALL: [BackendKind; 3] =
        [BackendKind::WebGpu, BackendKind::WebGl, BackendKind::Canvas2d];

    /// Next tier down, if any
    pub fn fallback(self) -> Option<BackendKind> {
        match self {
            BackendKind::WebGpu => Some(BackendKind::WebGl),
            BackendKind::WebGl => Some(BackendKind::Canvas2d),
            BackendKind::Canvas2d => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::WebGpu => "webgpu",
            BackendKind::WebGl => "webgl",
            BackendKind::Canvas2d => "canvas2d",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which tiers the last probe found usable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BackendCapability {
    pub canvas2d: bool,
    pub webgl: bool,
    pub webgpu: bool,
}

impl BackendCapability {
    pub fn supports(&self, kind: BackendKind) -> bool {
        match kind {
            BackendKind::WebGpu => self.webgpu,
            BackendKind::WebGl => self.webgl,
            BackendKind::Canvas2d => self.canvas2d,
        }
    }

    pub fn set(&mut self, kind: BackendKind, available: bool) {
        match kind {
            BackendKind::WebGpu => self.webgpu = available,
            BackendKind::WebGl => self.webgl = available,
            BackendKind::Canvas2d => self.canvas2d = available,
        }
    }
}

/// Paint parameters of one stroke
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrokeStyle {
    pub color: Color,
    /// 0.0 - 1.0
    pub opacity: f32,
    pub mode: StrokeMode,
}

impl StrokeStyle {
    pub fn from_record(record: &StrokeRecord) -> Self {
        Self {
            color: record.color,
            opacity: record.opacity.clamp(0.0, 1.0) as f32,
            mode: record.mode,
        }
    }

    /// Premultiplied paint color including opacity; alpha of `color` is ignored
    pub fn premultiplied(&self) -> [f32; 4] {
        self.color.with_alpha(self.opacity).to_premultiplied()
    }
}

/// Where composited frames end up (a canvas, a window surface, a test sink)
pub trait PresentTarget {
    fn present(&mut self, pixels: &PixelBuffer, dirty: Option<DirtyRect>) -> EngineResult<()>;
}

/// Headless present target that keeps a copy of every presented frame
#[derive(Debug, Clone, Default)]
pub struct PixelSurface {
    pixels: Option<PixelBuffer>,
    frames: u64,
}

impl PixelSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pixels(&self) -> Option<&PixelBuffer> {
        self.pixels.as_ref()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl PresentTarget for PixelSurface {
    fn present(&mut self, pixels: &PixelBuffer, dirty: Option<DirtyRect>) -> EngineResult<()> {
        match (&mut self.pixels, dirty) {
            (Some(current), Some(rect))
                if current.width() == pixels.width() && current.height() == pixels.height() =>
            {
                current.copy_rect_from(pixels, rect);
            }
            _ => self.pixels = Some(pixels.clone()),
        }
        self.frames += 1;
        Ok(())
    }
}

/// Backend-agnostic rendering contract
pub trait RenderBackend {
    fn kind(&self) -> BackendKind;

    /// Move layer content into this backend's representation
    fn adopt_layer(&mut self, layer: &mut Layer) -> EngineResult<()>;

    /// Move layer content out to host pixels
    fn release_layer(&mut self, layer: &mut Layer) -> EngineResult<()>;

    /// Rasterize a stroke into the layer; returns the touched pixels.
    ///
    /// Draw paints `color · coverage · opacity` with source-over. Erase
    /// lowers destination alpha by `coverage · opacity`.
    fn draw_stroke(
        &mut self,
        layer: &mut Layer,
        geometry: &StrokeGeometry,
        style: &StrokeStyle,
    ) -> EngineResult<Option<DirtyRect>>;

    fn fill(&mut self, layer: &mut Layer, color: Color) -> EngineResult<()>;

    fn clear(&mut self, layer: &mut Layer) -> EngineResult<()>;

    /// Composite visible layers bottom to top into `target`.
    ///
    /// Only `rect` is recomputed when given; pixels outside keep their value.
    fn composite_layers(
        &mut self,
        layers: &[&Layer],
        target: &mut CompositionBuffer,
        rect: Option<DirtyRect>,
    ) -> EngineResult<()>;

    fn present(
        &mut self,
        buffer: &CompositionBuffer,
        target: &mut dyn PresentTarget,
    ) -> EngineResult<()> {
        target.present(&buffer.pixels, buffer.dirty_rect)
    }

    /// Host copy of the layer's current pixels
    fn snapshot_layer(&mut self, layer: &Layer) -> EngineResult<PixelBuffer>;

    fn is_device_lost(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_chain_ends_at_canvas() {
        assert_eq!(BackendKind::WebGpu.fallback(), Some(BackendKind::WebGl));
        assert_eq!(BackendKind::WebGl.fallback(), Some(BackendKind::Canvas2d));
        assert_eq!(BackendKind::Canvas2d.fallback(), None);
        assert!(BackendKind::WebGpu < BackendKind::Canvas2d);
    }

    #[test]
    fn test_kind_display_matches_serde() {
        for kind in BackendKind::ALL {
            let Ok(json) = serde_json::to_string(&kind) else {
                panic!("kind should serialize");
            };
            assert_eq!(json, format!("\"{kind}\""));
        }
    }

    #[test]
    fn test_style_premultiplies_opacity() {
        let style = StrokeStyle {
            color: Color::new(1.0, 0.5, 0.0, 0.2),
            opacity: 0.5,
            mode: StrokeMode::Draw,
        };
        assert_eq!(style.premultiplied(), [0.5, 0.25, 0.0, 0.5]);
    }

    #[test]
    fn test_pixel_surface_applies_dirty_rect() {
        let mut surface = PixelSurface::new();
        let first = PixelBuffer::new(4, 4);
        let Ok(()) = surface.present(&first, None) else {
            panic!("present should succeed");
        };
        let white = PixelBuffer::filled(4, 4, Color::WHITE);
        let Ok(()) = surface.present(&white, Some(DirtyRect::new(0, 0, 1, 1))) else {
            panic!("present should succeed");
        };
        let Some(pixels) = surface.pixels() else {
            panic!("surface should hold a frame");
        };
        assert_eq!(pixels.pixel(0, 0), Some([255, 255, 255, 255]));
        assert_eq!(pixels.pixel(1, 1), Some([0, 0, 0, 0]));
        assert_eq!(surface.frames(), 2);
    }
}
