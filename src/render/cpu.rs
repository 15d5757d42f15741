//! CPU backend - the guaranteed baseline tier
//!
//! Layers stay in host memory. Strokes go through the coverage rasterizer,
//! compositing runs row-parallel on rayon.

use futures::future::{FutureExt, LocalBoxFuture};
use rayon::prelude::*;

use super::blend::{composite_pixel, draw_coverage, erase_coverage};
use super::raster::rasterize;
use super::{
    BackendKind, Color, CompositionBuffer, DirtyRect, PixelBuffer, RenderBackend, StrokeStyle,
};
use crate::brush::{BlendMode, StrokeGeometry, StrokeMode};
use crate::core::errors::{EngineError, EngineResult};
use crate::engine::BackendProvider;
use crate::layer::Layer;

#[derive(Debug, Default)]
pub struct CpuBackend {
    strokes_drawn: u64,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strokes_drawn(&self) -> u64 {
        self.strokes_drawn
    }
}

fn host_pixels_mut(layer: &mut Layer) -> EngineResult<&mut PixelBuffer> {
    let id = layer.id;
    layer.host_pixels_mut().ok_or(EngineError::SurfaceMismatch {
        layer: id,
        backend: BackendKind::Canvas2d,
    })
}

fn host_pixels(layer: &Layer) -> EngineResult<&PixelBuffer> {
    layer.host_pixels().ok_or(EngineError::SurfaceMismatch {
        layer: layer.id,
        backend: BackendKind::Canvas2d,
    })
}

impl RenderBackend for CpuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Canvas2d
    }

    fn adopt_layer(&mut self, layer: &mut Layer) -> EngineResult<()> {
        host_pixels_mut(layer).map(|_| ())
    }

    fn release_layer(&mut self, layer: &mut Layer) -> EngineResult<()> {
        host_pixels_mut(layer).map(|_| ())
    }

    fn draw_stroke(
        &mut self,
        layer: &mut Layer,
        geometry: &StrokeGeometry,
        style: &StrokeStyle,
    ) -> EngineResult<Option<DirtyRect>> {
        let (width, height) = (layer.width, layer.height);
        let pixels = host_pixels_mut(layer)?;
        if geometry.is_empty() {
            return Ok(None);
        }
        let Some(region) = DirtyRect::from_bounds(geometry.bounds, width, height) else {
            return Ok(None);
        };

        let mask = rasterize(geometry, region);
        let Some(touched) = mask.covered_rect() else {
            return Ok(None);
        };

        let stride = pixels.stride();
        let color = style.premultiplied();
        let opacity = style.opacity;
        let mode = style.mode;
        pixels
            .as_raw_mut()
            .par_chunks_mut(stride)
            .enumerate()
            .skip(region.y as usize)
            .take(region.height as usize)
            .for_each(|(y, row)| {
                let coverage = mask.row(y - region.y as usize);
                for (i, cov) in coverage.iter().enumerate() {
                    let x = region.x as usize + i;
                    let px = &mut row[x * 4..x * 4 + 4];
                    match mode {
                        StrokeMode::Draw => draw_coverage(px, color, *cov),
                        StrokeMode::Erase => erase_coverage(px, *cov * opacity),
                    }
                }
            });

        layer.dirty = true;
        self.strokes_drawn += 1;
        tracing::debug!("CPU stroke ({:?}) touched {:?}", mode, touched);
        Ok(Some(touched))
    }

    fn fill(&mut self, layer: &mut Layer, color: Color) -> EngineResult<()> {
        host_pixels_mut(layer)?.fill(color);
        layer.dirty = true;
        Ok(())
    }

    fn clear(&mut self, layer: &mut Layer) -> EngineResult<()> {
        host_pixels_mut(layer)?.clear();
        layer.dirty = true;
        Ok(())
    }

    fn composite_layers(
        &mut self,
        layers: &[&Layer],
        target: &mut CompositionBuffer,
        rect: Option<DirtyRect>,
    ) -> EngineResult<()> {
        let (width, height) = (target.width(), target.height());
        let Some(rect) = rect.unwrap_or(DirtyRect::full(width, height)).clamp_to(width, height)
        else {
            return Ok(());
        };

        let mut sources: Vec<(&PixelBuffer, f32, BlendMode)> = Vec::with_capacity(layers.len());
        for layer in layers.iter().filter(|l| l.visible && l.opacity > 0.0) {
            sources.push((host_pixels(layer)?, layer.opacity, layer.blend_mode));
        }

        let stride = target.pixels.stride();
        target
            .pixels
            .as_raw_mut()
            .par_chunks_mut(stride)
            .enumerate()
            .skip(rect.y as usize)
            .take(rect.height as usize)
            .for_each(|(y, row)| {
                for x in rect.x as usize..rect.right() as usize {
                    let mut out = [0u8; 4];
                    for (source, opacity, mode) in &sources {
                        if x >= source.width() as usize || y >= source.height() as usize {
                            continue;
                        }
                        let offset = y * source.stride() + x * 4;
                        let raw = source.as_raw();
                        let px = [raw[offset], raw[offset + 1], raw[offset + 2], raw[offset + 3]];
                        out = composite_pixel(out, px, *opacity, *mode);
                    }
                    row[x * 4..x * 4 + 4].copy_from_slice(&out);
                }
            });

        target.dirty_rect = Some(rect);
        Ok(())
    }

    fn snapshot_layer(&mut self, layer: &Layer) -> EngineResult<PixelBuffer> {
        host_pixels(layer).cloned()
    }
}

/// Always-available provider for the CPU tier
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuProvider;

impl BackendProvider for CpuProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Canvas2d
    }

    fn initialize(&self) -> LocalBoxFuture<'static, EngineResult<Box<dyn RenderBackend>>> {
        async { Ok(Box::new(CpuBackend::new()) as Box<dyn RenderBackend>) }.boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brush::Geometry;
    use crate::layer::{LayerId, LayerSurface, TextureId};

    fn square(x0: f32, y0: f32, x1: f32, y1: f32) -> StrokeGeometry {
        StrokeGeometry::from_parts(
            vec![Geometry {
                vertices: vec![[x0, y0], [x1, y0], [x1, y1], [x0, y1]],
                indices: vec![0, 1, 2, 0, 2, 3],
            }],
            false,
        )
    }

    fn style(mode: StrokeMode) -> StrokeStyle {
        StrokeStyle {
            color: Color::rgb(1.0, 0.0, 0.0),
            opacity: 1.0,
            mode,
        }
    }

    fn alpha_at(layer: &Layer, x: u32, y: u32) -> u8 {
        layer.host_pixels().and_then(|p| p.pixel(x, y)).map_or(0, |px| px[3])
    }

    #[test]
    fn test_draw_stroke_paints_and_reports_damage() {
        let mut backend = CpuBackend::new();
        let mut layer = Layer::new(LayerId(1), 16, 16);
        layer.dirty = false;

        let Ok(Some(damage)) =
            backend.draw_stroke(&mut layer, &square(4.0, 4.0, 8.0, 8.0), &style(StrokeMode::Draw))
        else {
            panic!("stroke should touch pixels");
        };
        assert_eq!(damage, DirtyRect::new(4, 4, 4, 4));
        assert!(layer.dirty);
        assert_eq!(layer.host_pixels().and_then(|p| p.pixel(5, 5)), Some([255, 0, 0, 255]));
        assert_eq!(alpha_at(&layer, 3, 3), 0);
    }

    #[test]
    fn test_draw_then_erase_restores_alpha() {
        let mut backend = CpuBackend::new();
        let mut layer = Layer::new(LayerId(1), 16, 16);
        // Sub-pixel edges exercise partial coverage
        let geometry = square(2.3, 2.6, 11.4, 9.2);

        let draw = StrokeStyle {
            opacity: 0.7,
            ..style(StrokeMode::Draw)
        };
        let erase = StrokeStyle {
            opacity: 0.7,
            ..style(StrokeMode::Erase)
        };
        assert!(matches!(backend.draw_stroke(&mut layer, &geometry, &draw), Ok(Some(_))));
        assert!(alpha_at(&layer, 5, 5) > 0);
        assert!(matches!(backend.draw_stroke(&mut layer, &geometry, &erase), Ok(Some(_))));

        for y in 0..16 {
            for x in 0..16 {
                assert_eq!(alpha_at(&layer, x, y), 0, "({x},{y})");
            }
        }
    }

    #[test]
    fn test_stroke_outside_layer_is_noop() {
        let mut backend = CpuBackend::new();
        let mut layer = Layer::new(LayerId(1), 8, 8);
        let outside = square(20.0, 20.0, 30.0, 30.0);
        let result = backend.draw_stroke(&mut layer, &outside, &style(StrokeMode::Draw));
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn test_composite_respects_order_opacity_and_visibility() {
        let mut backend = CpuBackend::new();
        let bottom = Layer::with_pixels(LayerId(1), PixelBuffer::filled(4, 4, Color::WHITE));
        let mut top = Layer::with_pixels(LayerId(2), PixelBuffer::filled(4, 4, Color::BLACK));
        top.set_opacity(0.5);
        let mut hidden = Layer::with_pixels(
            LayerId(3),
            PixelBuffer::filled(4, 4, Color::rgb(0.0, 0.0, 1.0)),
        );
        hidden.set_visible(false);

        let mut target = CompositionBuffer::new(4, 4);
        let Ok(()) = backend.composite_layers(&[&bottom, &top, &hidden], &mut target, None) else {
            panic!("composite should succeed");
        };
        assert_eq!(target.pixels.pixel(0, 0), Some([128, 128, 128, 255]));
        assert_eq!(target.dirty_rect, Some(DirtyRect::full(4, 4)));
    }

    #[test]
    fn test_composite_only_touches_rect() {
        let mut backend = CpuBackend::new();
        let white = Layer::with_pixels(LayerId(1), PixelBuffer::filled(4, 4, Color::WHITE));
        let mut target = CompositionBuffer::new(4, 4);
        let rect = DirtyRect::new(1, 1, 2, 2);
        let Ok(()) = backend.composite_layers(&[&white], &mut target, Some(rect)) else {
            panic!("composite should succeed");
        };
        assert_eq!(target.pixels.pixel(1, 1), Some([255, 255, 255, 255]));
        assert_eq!(target.pixels.pixel(0, 0), Some([0, 0, 0, 0]));
        assert_eq!(target.pixels.pixel(3, 3), Some([0, 0, 0, 0]));
    }

    #[test]
    fn test_device_layers_are_rejected() {
        let mut backend = CpuBackend::new();
        let mut layer = Layer::new(LayerId(4), 4, 4);
        layer.surface = LayerSurface::Device(TextureId(1));
        assert!(matches!(
            backend.adopt_layer(&mut layer),
            Err(EngineError::SurfaceMismatch { .. })
        ));
        assert!(backend.snapshot_layer(&layer).is_err());
    }

    #[tokio::test]
    async fn test_provider_initializes_cpu_backend() {
        let provider = CpuProvider;
        assert!(provider.is_supported());
        let Ok(backend) = provider.initialize().await else {
            panic!("cpu backend always initializes");
        };
        assert_eq!(backend.kind(), BackendKind::Canvas2d);
    }
}
